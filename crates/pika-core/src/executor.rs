//! Action execution seam and the handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::action::{Action, ActionKind, ActionResult};

/// Executes one planner-proposed action.
///
/// Infallible by signature: every outcome, including failure, is an
/// [`ActionResult`]. Implementations must be safe to call concurrently.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &Action) -> ActionResult;
}

/// A handler for a single action kind.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, data: &Map<String, Value>) -> ActionResult;
}

/// Routes actions to handlers by kind.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the handlers that need no external service.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(ActionKind::StopListening, Arc::new(StopListeningHandler));
        registry
    }

    /// Register a handler, replacing any previous one for the same kind.
    pub fn register(&mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) {
        let _ = self.handlers.insert(kind, handler);
    }

    pub fn unregister(&mut self, kind: &ActionKind) -> bool {
        self.handlers.remove(kind).is_some()
    }

    pub fn contains(&self, kind: &ActionKind) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<_> = self.handlers.keys().cloned().collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }

    pub fn count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait]
impl ActionExecutor for ActionRegistry {
    async fn execute(&self, action: &Action) -> ActionResult {
        let Some(handler) = self.handlers.get(&action.kind) else {
            return ActionResult::failed(
                action.kind.clone(),
                format!("unknown action type: {}", action.kind),
            );
        };
        let mut result = handler.handle(&action.data).await;
        result.action_type = action.kind.clone();
        result
    }
}

struct StopListeningHandler;

#[async_trait]
impl ActionHandler for StopListeningHandler {
    async fn handle(&self, _data: &Map<String, Value>) -> ActionResult {
        ActionResult::ok(
            ActionKind::StopListening,
            Some(json!({"message": "Stopping listening mode"})),
        )
    }
}
