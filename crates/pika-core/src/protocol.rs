//! Wire envelope shared by every component.
//!
//! Every frame on the socket is one JSON [`Envelope`]:
//! `{type, payload, request_id, format, timestamp}`. Outbound envelopes are
//! always built through the constructors here, which stamp a fresh
//! `request_id` and the capture time.
//!
//! Command flows are not correlated request/reply. The client infers context
//! from ordering: a `processing` status is always followed by `response` or
//! `error`, then `idle`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::action::ActionResult;
use crate::errors::ProtocolError;
use crate::ids::RequestId;
use crate::notification::{Notification, Priority};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Client → server utterance.
    Command,
    Response,
    Stream,
    /// Action execution result.
    Action,
    /// Bidirectional status update.
    Status,
    /// Server-initiated notification.
    Trigger,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Response => "response",
            Self::Stream => "stream",
            Self::Action => "action",
            Self::Status => "status",
            Self::Trigger => "trigger",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the client wants responses rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Htmx,
    Json,
    Push,
}

impl ResponseFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "htmx" => Some(Self::Htmx),
            "json" => Some(Self::Json),
            "push" => Some(Self::Push),
            _ => None,
        }
    }
}

/// Empty or unrecognized `format` values mean "no preference" so the frame
/// itself still decodes.
fn lenient_format<'de, D>(deserializer: D) -> Result<Option<ResponseFormat>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => {
            let format = ResponseFormat::parse(&s);
            if format.is_none() {
                tracing::warn!(format = %s, "ignoring unknown response format");
            }
            format
        }
        Some(other) => {
            tracing::warn!(format = %other, "ignoring non-string response format");
            None
        }
    })
}

/// Machine-readable error codes carried in `error` envelopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    AiError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::AiError => "AI_ERROR",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Listening,
    Processing,
    Speaking,
    Idle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiStatus {
    Ready,
    Busy,
    Error,
}

/// Inbound `command` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub wake_word: bool,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub emotion: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamPayload {
    pub chunk: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: Status,
    pub connected: bool,
    pub ai_status: AiStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub trigger_type: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

/// The typed message wrapper exchanged over the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub request_id: RequestId,
    #[serde(
        default,
        deserialize_with = "lenient_format",
        skip_serializing_if = "Option::is_none"
    )]
    pub format: Option<ResponseFormat>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Wrap an arbitrary serializable payload.
    pub fn new<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self::from_value(kind, payload))
    }

    fn from_value(kind: MessageType, payload: Value) -> Self {
        Self {
            kind,
            payload,
            request_id: RequestId::new(),
            format: None,
            timestamp: Utc::now(),
        }
    }

    // The typed payloads below only contain strings, bools, numbers and
    // JSON values, so serializing them cannot fail.
    fn typed<T: Serialize>(kind: MessageType, payload: &T) -> Self {
        Self::from_value(kind, serde_json::to_value(payload).unwrap_or_default())
    }

    pub fn command(text: impl Into<String>, wake_word: bool, confidence: f64) -> Self {
        Self::typed(
            MessageType::Command,
            &CommandPayload {
                text: text.into(),
                wake_word,
                confidence,
            },
        )
    }

    pub fn response(text: impl Into<String>, emotion: impl Into<String>) -> Self {
        Self::typed(
            MessageType::Response,
            &ResponsePayload {
                text: text.into(),
                emotion: emotion.into(),
            },
        )
    }

    pub fn stream_chunk(chunk: impl Into<String>, done: bool, full_text: Option<String>) -> Self {
        Self::typed(
            MessageType::Stream,
            &StreamPayload {
                chunk: chunk.into(),
                done,
                full_text,
            },
        )
    }

    pub fn status(status: Status, connected: bool, ai_status: AiStatus) -> Self {
        Self::typed(
            MessageType::Status,
            &StatusPayload {
                status,
                connected,
                ai_status,
            },
        )
    }

    /// `status{processing, connected, busy}`.
    pub fn processing() -> Self {
        Self::status(Status::Processing, true, AiStatus::Busy)
    }

    /// `status{idle, connected, ready}`: ready for the next command.
    pub fn idle() -> Self {
        Self::status(Status::Idle, true, AiStatus::Ready)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self::typed(
            MessageType::Error,
            &ErrorPayload {
                code,
                message: message.into(),
                details,
            },
        )
    }

    pub fn trigger(notification: &Notification) -> Self {
        Self::typed(
            MessageType::Trigger,
            &TriggerPayload {
                trigger_type: notification.kind.clone(),
                title: notification.title.clone(),
                message: notification.message.clone(),
                data: notification.data.clone(),
                priority: notification.priority,
            },
        )
    }

    pub fn action(result: &ActionResult) -> Self {
        Self::typed(MessageType::Action, result)
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
    }

    /// Decode the payload as `T`, regardless of the declared type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.kind,
            reason: e.to_string(),
        })
    }

    /// Decode a `command` payload. Fails on any other envelope type; a
    /// missing or `null` payload is an empty command.
    pub fn parse_command(&self) -> Result<CommandPayload, ProtocolError> {
        if self.kind != MessageType::Command {
            return Err(ProtocolError::UnexpectedType {
                expected: MessageType::Command,
                actual: self.kind,
            });
        }
        if self.payload.is_null() {
            return Ok(CommandPayload::default());
        }
        self.payload_as()
    }
}
