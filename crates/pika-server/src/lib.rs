//! Session transport and command dispatch: per-connection read/write loops,
//! the hub, the command orchestrator, action fan-out and the notification
//! bridge, served over Axum WebSockets.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod hub;
pub mod notify;
pub mod nudge;
pub mod server;
pub mod session;
pub mod triggers;

pub use bridge::NotificationBridge;
pub use config::ServerConfig;
pub use dispatch::{CommandDispatcher, CommandOutcome};
pub use error::ServerError;
pub use fanout::{dedup_actions, is_query_action, ActionFanout};
pub use hub::Hub;
pub use notify::{Notifier, NotifierSet, WebSocketNotifier};
pub use nudge::{NudgeScheduler, NudgeSettings};
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{EnvelopeHandler, Session, SessionConfig, SessionState};
