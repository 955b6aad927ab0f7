use std::time::Duration;

use crate::protocol::{ErrorCode, MessageType};

/// Faults raised while decoding or encoding wire envelopes.
///
/// These stay local to the component that hit them: a malformed frame is
/// logged and dropped by the read loop, a malformed command payload becomes
/// a `PARSE_ERROR` envelope for the originating session.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },
    #[error("expected {expected} envelope, got {actual}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Failures reported by the external planner.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("planner timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("invalid planner reply: {0}")]
    InvalidReply(String),
    #[error("planner unavailable: {0}")]
    Unavailable(String),
}

impl PlannerError {
    /// Machine-readable code surfaced to the client.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::AiError
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Provider(_) => "provider",
            Self::InvalidReply(_) => "invalid_reply",
            Self::Unavailable(_) => "unavailable",
        }
    }
}
