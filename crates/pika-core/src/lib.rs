//! Core types for the session transport and command dispatch: wire
//! envelopes, actions, the planner and executor seams, notifications.

pub mod action;
pub mod errors;
pub mod executor;
pub mod ids;
pub mod mock;
pub mod notification;
pub mod planner;
pub mod protocol;

pub use action::{Action, ActionKind, ActionResult};
pub use errors::{PlannerError, ProtocolError};
pub use executor::{ActionExecutor, ActionHandler, ActionRegistry};
pub use ids::{RequestId, SessionId};
pub use notification::{Notification, NotificationCallback, Priority, TriggerSource};
pub use planner::{NoopPlanner, Plan, Planner, Role, SpokenResponse, Turn};
pub use protocol::{AiStatus, Envelope, ErrorCode, MessageType, ResponseFormat, Status};
