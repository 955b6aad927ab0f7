//! Planner seam.
//!
//! The planner turns an utterance plus conversation history into a spoken
//! reply and a list of proposed actions. The dispatch core only depends on
//! this trait; provider integrations live outside it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::errors::PlannerError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the per-session conversation history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpokenResponse {
    pub text: String,
    #[serde(default)]
    pub emotion: String,
}

/// Planner reply. A missing `response` means nothing is spoken; actions may
/// still be proposed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub response: Option<SpokenResponse>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl Plan {
    pub fn say(text: impl Into<String>, emotion: impl Into<String>) -> Self {
        Self {
            response: Some(SpokenResponse {
                text: text.into(),
                emotion: emotion.into(),
            }),
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// `history` includes the current utterance as its last user turn.
    async fn process_with_history(
        &self,
        text: &str,
        history: &[Turn],
    ) -> Result<Plan, PlannerError>;
}

/// Stand-in used when no provider is wired up. Every command gets `AI_ERROR`.
#[derive(Clone, Debug, Default)]
pub struct NoopPlanner;

#[async_trait]
impl Planner for NoopPlanner {
    async fn process_with_history(
        &self,
        _text: &str,
        _history: &[Turn],
    ) -> Result<Plan, PlannerError> {
        Err(PlannerError::Unavailable(
            "no planner provider configured".into(),
        ))
    }
}
