use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use pika_core::ids::SessionId;
use pika_core::protocol::Envelope;

use crate::session::Session;

/// Registry of all live sessions.
///
/// Membership changes take the write lock and broadcasts take the read lock,
/// so a broadcast never observes a half-applied register/unregister. Sends
/// are non-blocking, so no lock is ever held across an await or a slow client.
#[derive(Default)]
pub struct Hub {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Returns `false` if it was already registered.
    pub fn register(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session.id()) {
            return false;
        }
        let _ = sessions.insert(session.id().clone(), session);
        true
    }

    /// Remove a session and close its outbound queue.
    pub fn unregister(&self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if let Some(session) = &removed {
            session.close();
        }
        removed
    }

    /// Enqueue `message` on every registered session. Returns how many
    /// sessions accepted it; full queues drop.
    pub fn broadcast(&self, message: Arc<String>) -> usize {
        let sessions = self.sessions.read();
        sessions
            .values()
            .filter(|session| session.send(Arc::clone(&message)))
            .count()
    }

    /// Encode once and broadcast.
    pub fn broadcast_envelope(&self, envelope: &Envelope) -> usize {
        match envelope.encode() {
            Ok(json) => self.broadcast(Arc::new(json)),
            Err(e) => {
                tracing::warn!(error = %e, kind = %envelope.kind, "failed to encode broadcast");
                0
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Unregister and close every session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        drained.len()
    }
}
