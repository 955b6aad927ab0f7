//! Delivery channels for notifications. The WebSocket hub is the only one
//! wired in; others (push, email) plug in through [`Notifier`].

use std::sync::Arc;

use async_trait::async_trait;
use pika_core::notification::Notification;

use crate::bridge::NotificationBridge;
use crate::error::ServerError;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), ServerError>;

    async fn send_to_user(&self, user_id: &str, notification: &Notification) -> Result<(), ServerError>;

    async fn broadcast(&self, notification: &Notification) -> Result<(), ServerError>;

    /// Short channel name, e.g. `websocket`.
    fn kind(&self) -> &str;
}

/// Delivers through the hub. Sessions carry no user identity, so every
/// variant is a broadcast.
pub struct WebSocketNotifier {
    bridge: NotificationBridge,
}

impl WebSocketNotifier {
    pub fn new(bridge: NotificationBridge) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Notifier for WebSocketNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), ServerError> {
        self.broadcast(notification).await
    }

    async fn send_to_user(&self, user_id: &str, notification: &Notification) -> Result<(), ServerError> {
        tracing::debug!(user_id, "no per-user sessions, broadcasting");
        self.broadcast(notification).await
    }

    async fn broadcast(&self, notification: &Notification) -> Result<(), ServerError> {
        let _ = self.bridge.publish(notification);
        Ok(())
    }

    fn kind(&self) -> &str {
        "websocket"
    }
}

/// Fans a notification out to every registered notifier.
#[derive(Default)]
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Broadcast through all notifiers. Every notifier is tried; the last
    /// error, if any, is returned.
    pub async fn broadcast(&self, notification: &Notification) -> Result<(), ServerError> {
        let mut last_err = None;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.broadcast(notification).await {
                tracing::warn!(notifier = notifier.kind(), error = %e, "notifier broadcast failed");
                last_err = Some(e);
            }
        }
        last_err.map_or(Ok(()), Err)
    }

    /// Send through the first notifier that succeeds.
    pub async fn send(&self, notification: &Notification) -> Result<(), ServerError> {
        for notifier in &self.notifiers {
            match notifier.send(notification).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(notifier = notifier.kind(), error = %e, "notifier send failed, trying next");
                }
            }
        }
        Ok(())
    }

    /// Send through the notifier of the given kind only.
    pub async fn send_via(&self, kind: &str, notification: &Notification) -> Result<(), ServerError> {
        match self.notifiers.iter().find(|n| n.kind() == kind) {
            Some(notifier) => notifier.send(notification).await,
            None => Ok(()),
        }
    }
}
