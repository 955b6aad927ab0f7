use std::sync::Arc;

use pika_core::notification::{Notification, NotificationCallback};
use pika_core::protocol::Envelope;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::hub::Hub;
use crate::triggers::{
    calendar_notification, reminder_notification, CalendarCallback, CalendarEvent,
    ReminderCallback, ReminderEvent, ReminderTier,
};

/// Turns externally triggered notifications into `trigger` envelopes
/// broadcast to every session.
#[derive(Clone)]
pub struct NotificationBridge {
    hub: Arc<Hub>,
}

impl NotificationBridge {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    /// Broadcast one notification. Returns how many sessions accepted it.
    pub fn publish(&self, notification: &Notification) -> usize {
        let delivered = self.hub.broadcast_envelope(&Envelope::trigger(notification));
        tracing::info!(
            trigger_type = %notification.kind,
            title = %notification.title,
            delivered,
            "trigger broadcast"
        );
        delivered
    }

    /// Callback suitable for [`TriggerSource::set_callback`](pika_core::notification::TriggerSource::set_callback).
    pub fn callback(&self) -> NotificationCallback {
        let bridge = self.clone();
        Arc::new(move |notification: Notification| {
            let _ = bridge.publish(&notification);
        })
    }

    /// Callback for a reminder scheduler: formats the due tier and broadcasts it.
    pub fn reminder_callback(&self) -> ReminderCallback {
        let bridge = self.clone();
        Arc::new(move |reminder: &ReminderEvent, tier: ReminderTier, time_until: chrono::Duration| {
            let _ = bridge.publish(&reminder_notification(reminder, tier, time_until));
        })
    }

    /// Callback for a calendar poller.
    pub fn calendar_callback(&self) -> CalendarCallback {
        let bridge = self.clone();
        Arc::new(move |event: &CalendarEvent, minutes_before: i64| {
            let _ = bridge.publish(&calendar_notification(event, minutes_before));
        })
    }

    /// Speak unprompted to every session as a plain `response`.
    pub fn announce(&self, text: &str, emotion: &str) -> usize {
        self.hub.broadcast_envelope(&Envelope::response(text, emotion))
    }

    /// Forward everything arriving on `rx` until the channel closes.
    pub fn spawn(&self, mut rx: broadcast::Receiver<Notification>) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(notification) => {
                        let _ = bridge.publish(&notification);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "notification bridge lagged, dropped triggers");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("notification channel closed");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use pika_core::notification::{Priority, TriggerSource};
    use pika_core::protocol::MessageType;
    use serde_json::json;

    fn reminder() -> Notification {
        Notification::new("reminder", "Reminder", "Reminder: Call mom - it's time!")
            .with_data(json!({"reminder_id": "r1", "tier": "at_time"}))
            .with_priority(Priority::High)
    }

    #[test]
    fn publish_reaches_every_session() {
        let hub = Arc::new(Hub::new());
        let (a, mut rx_a) = Session::new(8);
        let (b, mut rx_b) = Session::new(8);
        hub.register(a);
        hub.register(b);

        let bridge = NotificationBridge::new(Arc::clone(&hub));
        assert_eq!(bridge.publish(&reminder()), 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let env = Envelope::decode(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(env.kind, MessageType::Trigger);
            assert_eq!(env.payload["trigger_type"], "reminder");
            assert_eq!(env.payload["priority"], "high");
            assert_eq!(env.payload["data"]["reminder_id"], "r1");
        }
    }

    #[test]
    fn publish_with_no_sessions_is_fine() {
        let bridge = NotificationBridge::new(Arc::new(Hub::new()));
        assert_eq!(bridge.publish(&reminder()), 0);
    }

    #[test]
    fn announce_sends_response_envelope() {
        let hub = Arc::new(Hub::new());
        let (a, mut rx) = Session::new(8);
        hub.register(a);
        let bridge = NotificationBridge::new(hub);
        assert_eq!(bridge.announce("I'm still here if you need me!", "helpful"), 1);
        let env = Envelope::decode(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(env.kind, MessageType::Response);
        assert_eq!(env.payload["emotion"], "helpful");
    }

    struct Scheduler {
        callback: parking_lot::Mutex<Option<NotificationCallback>>,
    }

    impl TriggerSource for Scheduler {
        fn set_callback(&self, callback: NotificationCallback) {
            *self.callback.lock() = Some(callback);
        }
    }

    #[test]
    fn callback_wires_trigger_sources() {
        let hub = Arc::new(Hub::new());
        let (a, mut rx) = Session::new(8);
        hub.register(a);
        let bridge = NotificationBridge::new(hub);

        let scheduler = Scheduler {
            callback: parking_lot::Mutex::new(None),
        };
        scheduler.set_callback(bridge.callback());
        let cb = scheduler.callback.lock().clone().unwrap();
        cb(reminder());

        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn scheduler_callbacks_format_and_broadcast() {
        let hub = Arc::new(Hub::new());
        let (a, mut rx) = Session::new(8);
        hub.register(a);
        let bridge = NotificationBridge::new(hub);

        let reminder = ReminderEvent {
            id: "r9".into(),
            title: "Stretch".into(),
            description: String::new(),
            remind_at: chrono::Utc::now(),
        };
        (bridge.reminder_callback())(&reminder, ReminderTier::TenMinutes, chrono::Duration::minutes(10));
        let env = Envelope::decode(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(env.payload["message"], "Reminder: 'Stretch' in 10 minutes.");

        let event = CalendarEvent {
            id: "e1".into(),
            title: "Standup".into(),
            start_time: chrono::Utc::now(),
            location: None,
        };
        (bridge.calendar_callback())(&event, 5);
        let env = Envelope::decode(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(env.payload["title"], "Upcoming Event");
        assert_eq!(env.payload["message"], "Heads up! 'Standup' starts in 5 minutes.");
    }

    #[tokio::test]
    async fn spawned_bridge_forwards_channel() {
        let hub = Arc::new(Hub::new());
        let (a, mut rx) = Session::new(8);
        hub.register(a);
        let bridge = NotificationBridge::new(hub);

        let (tx, sub) = broadcast::channel(16);
        let handle = bridge.spawn(sub);
        tx.send(reminder()).unwrap();
        drop(tx);
        handle.await.unwrap();

        let env = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(env.kind, MessageType::Trigger);
    }
}
