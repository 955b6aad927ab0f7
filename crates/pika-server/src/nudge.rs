//! Idle nudges: after a quiet spell, say something time-of-day appropriate
//! to every connected client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Receives `(text, emotion)` for each nudge.
pub type NudgeCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NudgeSettings {
    pub idle_threshold: Duration,
    pub cooldown: Duration,
    pub check_interval: Duration,
}

impl Default for NudgeSettings {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(10 * 60),
            cooldown: Duration::from_secs(30 * 60),
            check_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => Self::Morning,
            12..=16 => Self::Afternoon,
            17..=20 => Self::Evening,
            _ => Self::Night,
        }
    }
}

type Line = (&'static str, &'static str);

const ANY_TIME: &[Line] = &[
    ("Hey! Just checking in. Need any help with anything?", "curious"),
    ("I'm still here if you need me!", "helpful"),
    ("Anything I can help you with?", "helpful"),
    ("I'm getting a bit lonely over here! Got any questions for me?", "playful"),
];

const MORNING: &[Line] = &[
    ("Good morning! Ready to tackle the day?", "helpful"),
    ("Morning! Want me to check your calendar for today?", "helpful"),
    ("Rise and shine! Anything I can help you get started with?", "playful"),
];

const AFTERNOON: &[Line] = &[
    ("How's your afternoon going? Need a hand with anything?", "curious"),
    ("Afternoon check-in! Everything going smoothly?", "helpful"),
    ("Taking a break? Let me know if you need anything!", "playful"),
];

const EVENING: &[Line] = &[
    ("Evening! Winding down or still going strong?", "curious"),
    ("Anything I can help you wrap up today?", "helpful"),
    ("Getting late! Don't forget to take a break if you need one.", "thoughtful"),
];

const NIGHT: &[Line] = &[
    ("Burning the midnight oil? I'm here if you need me!", "helpful"),
    ("Late night session! Want me to set a reminder for anything?", "helpful"),
    ("Still awake? Don't forget to rest!", "thoughtful"),
];

/// Candidate lines for a time of day: the generic set plus the time-specific one.
pub fn candidate_lines(time_of_day: TimeOfDay) -> Vec<Line> {
    let specific = match time_of_day {
        TimeOfDay::Morning => MORNING,
        TimeOfDay::Afternoon => AFTERNOON,
        TimeOfDay::Evening => EVENING,
        TimeOfDay::Night => NIGHT,
    };
    ANY_TIME.iter().chain(specific).copied().collect()
}

struct Activity {
    last_activity: Instant,
    last_nudge: Option<Instant>,
}

pub struct NudgeScheduler {
    settings: NudgeSettings,
    callback: RwLock<Option<NudgeCallback>>,
    activity: Mutex<Activity>,
    running: AtomicBool,
}

impl NudgeScheduler {
    pub fn new(settings: NudgeSettings) -> Self {
        Self {
            settings,
            callback: RwLock::new(None),
            activity: Mutex::new(Activity {
                last_activity: Instant::now(),
                last_nudge: None,
            }),
            running: AtomicBool::new(false),
        }
    }

    pub fn set_callback(&self, callback: NudgeCallback) {
        *self.callback.write() = Some(callback);
    }

    pub fn record_activity(&self) {
        self.activity.lock().last_activity = Instant::now();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Deliver a nudge if the user has been idle long enough and the
    /// cooldown has passed. Returns the line that was sent.
    pub fn check_at(&self, now: Instant, hour: u32) -> Option<Line> {
        let callback = self.callback.read().clone()?;

        let line = {
            let mut activity = self.activity.lock();
            if now.saturating_duration_since(activity.last_activity) < self.settings.idle_threshold {
                return None;
            }
            if let Some(last) = activity.last_nudge {
                if now.saturating_duration_since(last) < self.settings.cooldown {
                    return None;
                }
            }
            let lines = candidate_lines(TimeOfDay::from_hour(hour));
            let line = *lines.choose(&mut rand::thread_rng())?;
            activity.last_nudge = Some(now);
            line
        };

        tracing::info!(text = line.0, emotion = line.1, "sending idle nudge");
        callback(line.0, line.1);
        Some(line)
    }

    /// Start the periodic idle check. Returns `None` if already running.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return None;
        }
        let scheduler = Arc::clone(self);
        let period = self.settings.check_interval;
        tracing::info!(check_interval_secs = period.as_secs(), "nudge scheduler started");

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = scheduler.check_at(Instant::now(), chrono::Local::now().hour());
                    }
                }
            }
            scheduler.running.store(false, Ordering::Release);
            tracing::info!("nudge scheduler stopped");
        }))
    }
}
