//! Formatting for scheduler-driven triggers (reminder tiers, calendar
//! look-ahead). The schedulers themselves live outside this crate; they call
//! back with an event and a lead time and get a ready-to-broadcast
//! [`Notification`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pika_core::notification::{Notification, Priority};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const REMINDER_TRIGGER: &str = "reminder";

/// Width of the window below a tier's lead time in which it may still fire.
const TIER_GRACE_MINUTES: i64 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReminderTier {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "12h")]
    HalfDay,
    #[serde(rename = "3h")]
    ThreeHours,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "10m")]
    TenMinutes,
    #[serde(rename = "at_time")]
    AtTime,
}

impl ReminderTier {
    pub const ALL: [ReminderTier; 6] = [
        Self::Day,
        Self::HalfDay,
        Self::ThreeHours,
        Self::OneHour,
        Self::TenMinutes,
        Self::AtTime,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Day => "24h",
            Self::HalfDay => "12h",
            Self::ThreeHours => "3h",
            Self::OneHour => "1h",
            Self::TenMinutes => "10m",
            Self::AtTime => "at_time",
        }
    }

    pub fn lead_time(&self) -> Duration {
        match self {
            Self::Day => Duration::hours(24),
            Self::HalfDay => Duration::hours(12),
            Self::ThreeHours => Duration::hours(3),
            Self::OneHour => Duration::hours(1),
            Self::TenMinutes => Duration::minutes(10),
            Self::AtTime => Duration::zero(),
        }
    }

    /// Whether this tier is due with `time_until` left before the reminder.
    pub fn should_notify(&self, time_until: Duration) -> bool {
        if *self == Self::AtTime {
            return time_until <= Duration::minutes(1);
        }
        let lead = self.lead_time();
        time_until <= lead && time_until > lead - Duration::minutes(TIER_GRACE_MINUTES)
    }
}

/// Tiers due now that have not been sent yet, in tier order.
pub fn due_tiers(time_until: Duration, already_sent: &[ReminderTier]) -> Vec<ReminderTier> {
    ReminderTier::ALL
        .into_iter()
        .filter(|tier| !already_sent.contains(tier) && tier.should_notify(time_until))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReminderEvent {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub remind_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub location: Option<String>,
}

/// Callback a reminder scheduler invokes per due tier.
pub type ReminderCallback = Arc<dyn Fn(&ReminderEvent, ReminderTier, Duration) + Send + Sync>;

/// Callback a calendar poller invokes with minutes left before an event.
pub type CalendarCallback = Arc<dyn Fn(&CalendarEvent, i64) + Send + Sync>;

/// Human-readable lead time: "2 days and 3 hours", "45 minutes", "now"...
pub fn format_time_until(d: Duration) -> String {
    if d < Duration::zero() {
        return "now".to_string();
    }
    let total_minutes = d.num_minutes();
    let mut hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    if hours >= 24 {
        let days = hours / 24;
        hours %= 24;
        return if hours > 0 {
            format!("{days} days and {hours} hours")
        } else {
            format!("{days} days")
        };
    }
    if hours > 0 {
        return if minutes > 0 {
            format!("{hours} hours and {minutes} minutes")
        } else {
            format!("{hours} hours")
        };
    }
    if minutes > 0 {
        return format!("{minutes} minutes");
    }
    "less than a minute".to_string()
}

pub fn reminder_notification(
    reminder: &ReminderEvent,
    tier: ReminderTier,
    time_until: Duration,
) -> Notification {
    let mut message = match tier {
        ReminderTier::AtTime => format!("Reminder: {} - it's time!", reminder.title),
        _ => format!(
            "Reminder: '{}' in {}.",
            reminder.title,
            format_time_until(time_until)
        ),
    };
    if !reminder.description.is_empty() {
        message.push(' ');
        message.push_str(&reminder.description);
    }

    let notification = Notification::new(REMINDER_TRIGGER, "Reminder", message).with_data(json!({
        "reminder_id": reminder.id,
        "title": reminder.title,
        "remind_at": reminder.remind_at,
        "tier": tier.name(),
    }));
    match tier {
        ReminderTier::AtTime => notification.with_priority(Priority::High),
        _ => notification.with_priority(Priority::Normal),
    }
}

pub fn calendar_notification(event: &CalendarEvent, minutes_before: i64) -> Notification {
    let mut message = if minutes_before == 5 {
        format!("Heads up! '{}' starts in 5 minutes.", event.title)
    } else {
        format!("Reminder: '{}' starts in {} minutes.", event.title, minutes_before)
    };
    if let Some(location) = event.location.as_deref().filter(|l| !l.is_empty()) {
        message.push_str(" Location: ");
        message.push_str(location);
    }

    Notification::new(REMINDER_TRIGGER, "Upcoming Event", message).with_data(json!({
        "event_id": event.id,
        "title": event.title,
        "start_time": event.start_time,
        "location": event.location.clone().unwrap_or_default(),
    }))
}
