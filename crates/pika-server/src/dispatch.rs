//! Command dispatch: turns one inbound `command` envelope into
//! `processing → (response | error) → idle`, then fans out actions.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use pika_core::action::ActionResult;
use pika_core::errors::PlannerError;
use pika_core::executor::ActionExecutor;
use pika_core::planner::{Planner, Turn};
use pika_core::protocol::{Envelope, ErrorCode, MessageType};
use tokio::task::JoinHandle;

use crate::fanout::{panic_message, ActionFanout};
use crate::nudge::NudgeScheduler;
use crate::session::{EnvelopeHandler, Session};

pub const PARSE_ERROR_MESSAGE: &str = "Failed to parse command";
pub const AI_ERROR_MESSAGE: &str = "Failed to process command";

/// How a dispatched command ended.
#[derive(Debug)]
pub enum CommandOutcome {
    /// The planner answered; one handle per dispatched action.
    Responded {
        actions: Vec<JoinHandle<ActionResult>>,
    },
    Failed(PlannerError),
}

pub struct CommandDispatcher {
    planner: Arc<dyn Planner>,
    fanout: ActionFanout,
    nudge: Option<Arc<NudgeScheduler>>,
}

impl CommandDispatcher {
    pub fn new(planner: Arc<dyn Planner>, executor: Arc<dyn ActionExecutor>) -> Self {
        Self {
            planner,
            fanout: ActionFanout::new(executor),
            nudge: None,
        }
    }

    /// Record user activity on `nudge` for every accepted command.
    pub fn with_activity_tracker(mut self, nudge: Arc<NudgeScheduler>) -> Self {
        self.nudge = Some(nudge);
        self
    }

    /// Run the synchronous part of a command and spawn the rest.
    ///
    /// Returns `None` when the payload does not parse; the session then gets
    /// a `PARSE_ERROR` envelope and never sees `processing`.
    pub fn handle_command(
        &self,
        session: &Arc<Session>,
        envelope: &Envelope,
    ) -> Option<JoinHandle<CommandOutcome>> {
        let command = match envelope.parse_command() {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "failed to parse command");
                let _ = session.send_envelope(&Envelope::error(
                    ErrorCode::ParseError,
                    PARSE_ERROR_MESSAGE,
                    Some(e.to_string()),
                ));
                return None;
            }
        };

        tracing::debug!(
            session_id = %session.id(),
            request_id = %envelope.request_id,
            wake_word = command.wake_word,
            confidence = command.confidence,
            "received command"
        );

        let _ = session.send_envelope(&Envelope::processing());
        session.push_turn(Turn::user(command.text.clone()));
        if let Some(nudge) = &self.nudge {
            nudge.record_activity();
        }

        let planner = Arc::clone(&self.planner);
        let fanout = self.fanout.clone();
        let session = Arc::clone(session);
        Some(tokio::spawn(async move {
            process(planner, fanout, session, command.text).await
        }))
    }
}

impl EnvelopeHandler for CommandDispatcher {
    fn handle(&self, session: &Arc<Session>, envelope: Envelope) {
        match envelope.kind {
            MessageType::Command => {
                let _ = self.handle_command(session, &envelope);
            }
            MessageType::Status => {
                tracing::debug!(session_id = %session.id(), request_id = %envelope.request_id, "status update from client");
            }
            other => {
                tracing::warn!(session_id = %session.id(), kind = %other, "unknown message type");
            }
        }
    }
}

async fn process(
    planner: Arc<dyn Planner>,
    fanout: ActionFanout,
    session: Arc<Session>,
    text: String,
) -> CommandOutcome {
    let history = session.history();
    let start = Instant::now();
    let reply = AssertUnwindSafe(planner.process_with_history(&text, &history))
        .catch_unwind()
        .await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let plan = match reply {
        Ok(Ok(plan)) => plan,
        Ok(Err(err)) => return fail(&session, err, elapsed_ms),
        Err(panic) => {
            let err = PlannerError::Provider(format!("planner panicked: {}", panic_message(panic.as_ref())));
            return fail(&session, err, elapsed_ms);
        }
    };

    tracing::debug!(
        session_id = %session.id(),
        elapsed_ms,
        actions = plan.actions.len(),
        "planner replied"
    );

    if let Some(response) = plan.response {
        let _ = session.send_envelope(&Envelope::response(&response.text, &response.emotion));
        session.push_turn(Turn::assistant(response.text));
    }
    let _ = session.send_envelope(&Envelope::idle());

    CommandOutcome::Responded {
        actions: fanout.dispatch(&session, plan.actions),
    }
}

fn fail(session: &Session, err: PlannerError, elapsed_ms: u64) -> CommandOutcome {
    tracing::warn!(
        session_id = %session.id(),
        error_kind = err.error_kind(),
        error = %err,
        elapsed_ms,
        "planner failed"
    );
    let _ = session.send_envelope(&Envelope::error(
        err.code(),
        AI_ERROR_MESSAGE,
        Some(err.to_string()),
    ));
    let _ = session.send_envelope(&Envelope::idle());
    CommandOutcome::Failed(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pika_core::action::Action;
    use pika_core::mock::{MockExecutor, MockOutcome, MockPlanner, MockReply};
    use pika_core::planner::{Plan, Role};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(Envelope::decode(&frame).unwrap());
        }
        out
    }

    /// `type` or `type(status)` per frame.
    fn labels(frames: &[Envelope]) -> Vec<String> {
        frames
            .iter()
            .map(|f| match f.kind {
                MessageType::Status => format!("status({})", f.payload["status"].as_str().unwrap()),
                kind => kind.to_string(),
            })
            .collect()
    }

    async fn finish(outcome: CommandOutcome) -> Vec<ActionResult> {
        match outcome {
            CommandOutcome::Responded { actions } => {
                let mut results = Vec::new();
                for h in actions {
                    results.push(h.await.unwrap());
                }
                results
            }
            CommandOutcome::Failed(_) => Vec::new(),
        }
    }

    fn dispatcher(planner: MockPlanner, executor: MockExecutor) -> (CommandDispatcher, Arc<MockPlanner>, Arc<MockExecutor>) {
        let planner = Arc::new(planner);
        let executor = Arc::new(executor);
        (
            CommandDispatcher::new(planner.clone(), executor.clone()),
            planner,
            executor,
        )
    }

    #[tokio::test]
    async fn reminder_command_frame_order() {
        let plan = Plan::say("Okay, I'll remind you.", "helpful").with_action(Action::with_json(
            "CREATE_REMINDER",
            json!({"title": "Call mom", "remind_at": "2026-03-01T17:00:00Z"}),
        ));
        let (dispatcher, planner, executor) = dispatcher(MockPlanner::new(vec![MockReply::Plan(plan)]), MockExecutor::new());
        let (session, mut rx) = Session::new(32);

        let cmd = Envelope::command("Remind me to call mom at 5pm", false, 0.9);
        let handle = dispatcher.handle_command(&session, &cmd).unwrap();
        let results = finish(handle.await.unwrap()).await;

        assert_eq!(results.len(), 1);
        assert_eq!(executor.calls_for(&pika_core::action::ActionKind::CreateReminder), 1);
        assert_eq!(planner.call_count(), 1);

        let frames = drain(&mut rx);
        assert_eq!(labels(&frames), vec!["status(processing)", "response", "status(idle)"]);
        assert_eq!(frames[1].payload["text"], "Okay, I'll remind you.");
        assert_eq!(frames[1].payload["emotion"], "helpful");
    }

    #[tokio::test]
    async fn duplicate_memory_saves_execute_once() {
        let plan = Plan::say("Noted.", "happy")
            .with_action(Action::with_json("SAVE_MEMORY", json!({"content": "X"})))
            .with_action(Action::with_json("SAVE_MEMORY", json!({"content": "X"})));
        let (dispatcher, _planner, executor) = dispatcher(MockPlanner::new(vec![MockReply::Plan(plan)]), MockExecutor::new());
        let (session, _rx) = Session::new(32);

        let handle = dispatcher
            .handle_command(&session, &Envelope::command("remember X", false, 1.0))
            .unwrap();
        let results = finish(handle.await.unwrap()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(executor.executed().len(), 1);
    }

    #[tokio::test]
    async fn planner_timeout_yields_ai_error_then_idle() {
        let (dispatcher, _planner, executor) = dispatcher(
            MockPlanner::new(vec![MockReply::Error(PlannerError::Timeout(Duration::from_secs(30)))]),
            MockExecutor::new(),
        );
        let (session, mut rx) = Session::new(32);

        let handle = dispatcher
            .handle_command(&session, &Envelope::command("what's up", true, 0.8))
            .unwrap();
        assert!(matches!(handle.await.unwrap(), CommandOutcome::Failed(PlannerError::Timeout(_))));

        let frames = drain(&mut rx);
        assert_eq!(labels(&frames), vec!["status(processing)", "error", "status(idle)"]);
        assert_eq!(frames[1].payload["code"], "AI_ERROR");
        assert_eq!(frames[1].payload["message"], AI_ERROR_MESSAGE);
        assert!(executor.executed().is_empty());
        // Only the user turn is kept.
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test]
    async fn planner_panic_is_reported_as_ai_error() {
        let (dispatcher, _planner, _executor) = dispatcher(
            MockPlanner::new(vec![MockReply::Panic("provider bug".into())]),
            MockExecutor::new(),
        );
        let (session, mut rx) = Session::new(32);

        let handle = dispatcher
            .handle_command(&session, &Envelope::command("hi", false, 1.0))
            .unwrap();
        assert!(matches!(handle.await.unwrap(), CommandOutcome::Failed(PlannerError::Provider(_))));
        let frames = drain(&mut rx);
        assert_eq!(labels(&frames), vec!["status(processing)", "error", "status(idle)"]);
    }

    #[tokio::test]
    async fn bad_payload_never_enters_processing() {
        let (dispatcher, planner, _executor) = dispatcher(MockPlanner::new(vec![]), MockExecutor::new());
        let (session, mut rx) = Session::new(32);

        let bad = Envelope::decode(r#"{"type":"command","payload":{"text":["not","a","string"]}}"#).unwrap();
        assert!(dispatcher.handle_command(&session, &bad).is_none());

        let frames = drain(&mut rx);
        assert_eq!(labels(&frames), vec!["error"]);
        assert_eq!(frames[0].payload["code"], "PARSE_ERROR");
        assert!(frames[0].payload["details"].is_string());
        assert_eq!(planner.call_count(), 0);
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn response_precedes_action_results() {
        let plan = Plan::say("Here's the weather.", "neutral")
            .with_action(Action::with_json("GET_WEATHER", json!({"location": "Paris"})))
            .with_action(Action::with_json("SAVE_MEMORY", json!({"content": "likes Paris"})));
        let executor = MockExecutor::new()
            .with_outcome("GET_WEATHER", MockOutcome::Succeed(Some(json!({"temp": 12}))))
            .with_outcome("SAVE_MEMORY", MockOutcome::Fail("store offline".into()));
        let (dispatcher, _planner, _executor) = dispatcher(MockPlanner::new(vec![MockReply::Plan(plan)]), executor);
        let (session, mut rx) = Session::new(32);

        let handle = dispatcher
            .handle_command(&session, &Envelope::command("weather in Paris", false, 1.0))
            .unwrap();
        finish(handle.await.unwrap()).await;

        let frames = drain(&mut rx);
        let labels = labels(&frames);
        assert_eq!(&labels[..3], ["status(processing)", "response", "status(idle)"]);
        assert_eq!(labels.len(), 5);
        assert!(labels[3..].iter().all(|l| l == "action"));
        let mut types: Vec<_> = frames[3..]
            .iter()
            .map(|f| f.payload["action_type"].as_str().unwrap().to_string())
            .collect();
        types.sort();
        assert_eq!(types, vec!["GET_WEATHER", "SAVE_MEMORY"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_does_not_wait_for_slow_actions() {
        let plan = Plan::say("On it.", "").with_action(Action::with_json("SAVE_MEMORY", json!({"content": "a"})));
        let executor = MockExecutor::new().with_delay(Duration::from_secs(60));
        let (dispatcher, _planner, _executor) = dispatcher(MockPlanner::new(vec![MockReply::Plan(plan)]), executor);
        let (session, mut rx) = Session::new(32);

        let handle = dispatcher
            .handle_command(&session, &Envelope::command("save a", false, 1.0))
            .unwrap();
        let CommandOutcome::Responded { actions } = handle.await.unwrap() else {
            panic!("expected a response");
        };
        let frames = drain(&mut rx);
        assert_eq!(labels(&frames), vec!["status(processing)", "response", "status(idle)"]);
        assert!(!actions[0].is_finished());
        for h in actions {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn history_accumulates_across_commands() {
        let (dispatcher, planner, _executor) = dispatcher(
            MockPlanner::new(vec![MockReply::say("Hi there!", "happy"), MockReply::say("You said hello.", "")]),
            MockExecutor::new(),
        );
        let (session, _rx) = Session::new(32);

        for text in ["hello", "what did I say?"] {
            let handle = dispatcher
                .handle_command(&session, &Envelope::command(text, false, 1.0))
                .unwrap();
            finish(handle.await.unwrap()).await;
        }

        let histories = planner.histories();
        assert_eq!(histories[0].len(), 1);
        assert_eq!(histories[1].len(), 3);
        assert_eq!(histories[1][1].role, Role::Assistant);
        assert_eq!(histories[1][2].content, "what did I say?");
        assert_eq!(session.history().len(), 4);
    }

    #[tokio::test]
    async fn reply_without_response_still_goes_idle() {
        let plan = Plan::default();
        let (dispatcher, _planner, _executor) = dispatcher(MockPlanner::new(vec![MockReply::Plan(plan)]), MockExecutor::new());
        let (session, mut rx) = Session::new(32);

        let handle = dispatcher
            .handle_command(&session, &Envelope::command("hmm", false, 0.2))
            .unwrap();
        finish(handle.await.unwrap()).await;

        let frames = drain(&mut rx);
        assert_eq!(labels(&frames), vec!["status(processing)", "status(idle)"]);
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test]
    async fn handler_ignores_non_command_envelopes() {
        let (dispatcher, planner, _executor) = dispatcher(MockPlanner::new(vec![]), MockExecutor::new());
        let (session, mut rx) = Session::new(32);

        dispatcher.handle(&session, Envelope::status(pika_core::protocol::Status::Listening, true, pika_core::protocol::AiStatus::Ready));
        dispatcher.handle(&session, Envelope::response("echo", ""));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(planner.call_count(), 0);
    }
}
