//! Scripted planner and executor for deterministic tests without a provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::action::{Action, ActionKind, ActionResult};
use crate::errors::PlannerError;
use crate::executor::ActionExecutor;
use crate::planner::{Plan, Planner, Turn};

/// Pre-programmed planner replies.
#[derive(Clone, Debug)]
pub enum MockReply {
    Plan(Plan),
    Error(PlannerError),
    /// Panic inside the planner call.
    Panic(String),
    /// Wait a duration, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn say(text: &str, emotion: &str) -> Self {
        Self::Plan(Plan::say(text, emotion))
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Planner that returns pre-programmed replies in sequence.
pub struct MockPlanner {
    replies: Vec<MockReply>,
    call_count: AtomicUsize,
    histories: Mutex<Vec<Vec<Turn>>>,
}

impl MockPlanner {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            call_count: AtomicUsize::new(0),
            histories: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// History passed to each call, in call order.
    pub fn histories(&self) -> Vec<Vec<Turn>> {
        self.histories.lock().clone()
    }
}

#[async_trait]
impl Planner for MockPlanner {
    async fn process_with_history(
        &self,
        _text: &str,
        history: &[Turn],
    ) -> Result<Plan, PlannerError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.histories.lock().push(history.to_vec());

        let Some(mut current) = self.replies.get(idx).cloned() else {
            return Err(PlannerError::Unavailable(format!(
                "MockPlanner: no reply configured for call {idx}"
            )));
        };
        loop {
            match current {
                MockReply::Plan(plan) => return Ok(plan),
                MockReply::Error(e) => return Err(e),
                MockReply::Panic(msg) => panic!("{msg}"),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}

/// Scripted outcome for one action kind.
#[derive(Clone, Debug)]
pub enum MockOutcome {
    Succeed(Option<Value>),
    Fail(String),
    Panic(String),
}

/// Executor with per-kind scripted outcomes. Unscripted kinds succeed with
/// no data.
#[derive(Default)]
pub struct MockExecutor {
    outcomes: HashMap<ActionKind, MockOutcome>,
    delay: Option<Duration>,
    executed: Mutex<Vec<Action>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(mut self, kind: impl Into<ActionKind>, outcome: MockOutcome) -> Self {
        let _ = self.outcomes.insert(kind.into(), outcome);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every action executed so far, in the order execution started.
    pub fn executed(&self) -> Vec<Action> {
        self.executed.lock().clone()
    }

    pub fn calls_for(&self, kind: &ActionKind) -> usize {
        self.executed.lock().iter().filter(|a| &a.kind == kind).count()
    }
}

#[async_trait]
impl ActionExecutor for MockExecutor {
    async fn execute(&self, action: &Action) -> ActionResult {
        self.executed.lock().push(action.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.outcomes.get(&action.kind) {
            None => ActionResult::ok(action.kind.clone(), None),
            Some(MockOutcome::Succeed(data)) => ActionResult::ok(action.kind.clone(), data.clone()),
            Some(MockOutcome::Fail(err)) => ActionResult::failed(action.kind.clone(), err.clone()),
            Some(MockOutcome::Panic(msg)) => panic!("{msg}"),
        }
    }
}
