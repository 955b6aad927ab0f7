//! Concurrent execution of planner-proposed actions.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use pika_core::action::{Action, ActionKind, ActionResult};
use pika_core::executor::ActionExecutor;
use pika_core::protocol::Envelope;
use tokio::task::JoinHandle;

use crate::session::Session;

/// Actions whose successful result the user is waiting to see or hear.
pub fn is_query_action(kind: &ActionKind) -> bool {
    matches!(
        kind,
        ActionKind::GetWeather
            | ActionKind::SearchPokemon
            | ActionKind::StopListening
            | ActionKind::ListReminders
            | ActionKind::StartGame
            | ActionKind::GameMove
    )
}

/// Composite identity of an action: `TYPE`, then `:content` and `:title`
/// when those fields are present.
pub fn dedup_key(action: &Action) -> String {
    let mut key = action.kind.to_string();
    if let Some(content) = action.str_field("content") {
        key.push(':');
        key.push_str(content);
    }
    if let Some(title) = action.str_field("title") {
        key.push(':');
        key.push_str(title);
    }
    key
}

/// Drop repeated actions. The first occurrence wins and order is kept.
pub fn dedup_actions(actions: Vec<Action>) -> Vec<Action> {
    let mut seen = HashSet::with_capacity(actions.len());
    actions
        .into_iter()
        .filter(|action| {
            let key = dedup_key(action);
            if seen.insert(key.clone()) {
                true
            } else {
                tracing::debug!(key = %key, "skipping duplicate action");
                false
            }
        })
        .collect()
}

/// Spawns one task per action against the shared executor and routes
/// results back to the originating session.
#[derive(Clone)]
pub struct ActionFanout {
    executor: Arc<dyn ActionExecutor>,
}

impl ActionFanout {
    pub fn new(executor: Arc<dyn ActionExecutor>) -> Self {
        Self { executor }
    }

    /// Deduplicate `actions` and run each survivor concurrently.
    ///
    /// Failures are always sent to `session`; successes only for query
    /// actions. A session that closed in the meantime silently drops them.
    pub fn dispatch(&self, session: &Arc<Session>, actions: Vec<Action>) -> Vec<JoinHandle<ActionResult>> {
        dedup_actions(actions)
            .into_iter()
            .map(|action| {
                let executor = Arc::clone(&self.executor);
                let session = Arc::clone(session);
                tokio::spawn(async move { execute_one(executor, session, action).await })
            })
            .collect()
    }
}

async fn execute_one(
    executor: Arc<dyn ActionExecutor>,
    session: Arc<Session>,
    action: Action,
) -> ActionResult {
    let start = Instant::now();
    let outcome = AssertUnwindSafe(executor.execute(&action)).catch_unwind().await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let result = match outcome {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            tracing::error!(
                session_id = %session.id(),
                action = %action.kind,
                reason = %reason,
                "action executor panicked"
            );
            ActionResult::failed(action.kind.clone(), format!("action panicked: {reason}"))
        }
    };

    if !result.success {
        tracing::warn!(
            session_id = %session.id(),
            action = %action.kind,
            elapsed_ms,
            error = result.error.as_deref().unwrap_or_default(),
            "action failed"
        );
        let _ = session.send_envelope(&Envelope::action(&result));
    } else if is_query_action(&action.kind) {
        tracing::debug!(session_id = %session.id(), action = %action.kind, elapsed_ms, "query action completed");
        let _ = session.send_envelope(&Envelope::action(&result));
    } else {
        tracing::debug!(session_id = %session.id(), action = %action.kind, elapsed_ms, "action completed");
    }
    result
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
