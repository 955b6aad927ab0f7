use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Action kinds the planner is known to propose.
///
/// Anything else survives as [`ActionKind::Other`] so an unrecognized kind
/// still reaches the executor (which reports it as unknown) instead of
/// failing the whole planner reply.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    SaveToCalendar,
    EditCalendarEvent,
    DeleteCalendarEvent,
    SaveMemory,
    GetWeather,
    SearchPokemon,
    StopListening,
    CreateReminder,
    ListReminders,
    StartGame,
    GameMove,
    NoAction,
    Other(String),
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::SaveToCalendar => "SAVE_TO_CALENDAR",
            Self::EditCalendarEvent => "EDIT_CALENDAR_EVENT",
            Self::DeleteCalendarEvent => "DELETE_CALENDAR_EVENT",
            Self::SaveMemory => "SAVE_MEMORY",
            Self::GetWeather => "GET_WEATHER",
            Self::SearchPokemon => "SEARCH_POKEMON",
            Self::StopListening => "STOP_LISTENING",
            Self::CreateReminder => "CREATE_REMINDER",
            Self::ListReminders => "LIST_REMINDERS",
            Self::StartGame => "START_GAME",
            Self::GameMove => "GAME_MOVE",
            Self::NoAction => "NO_ACTION",
            Self::Other(raw) => raw,
        }
    }
}

impl From<String> for ActionKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "SAVE_TO_CALENDAR" => Self::SaveToCalendar,
            "EDIT_CALENDAR_EVENT" => Self::EditCalendarEvent,
            "DELETE_CALENDAR_EVENT" => Self::DeleteCalendarEvent,
            "SAVE_MEMORY" => Self::SaveMemory,
            "GET_WEATHER" => Self::GetWeather,
            "SEARCH_POKEMON" => Self::SearchPokemon,
            "STOP_LISTENING" => Self::StopListening,
            "CREATE_REMINDER" => Self::CreateReminder,
            "LIST_REMINDERS" => Self::ListReminders,
            "START_GAME" => Self::StartGame,
            "GAME_MOVE" => Self::GameMove,
            "NO_ACTION" => Self::NoAction,
            _ => Self::Other(raw),
        }
    }
}

impl From<&str> for ActionKind {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A planner-proposed side effect. `data` is opaque to the dispatch core;
/// each handler validates its own fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Action {
    pub fn new(kind: impl Into<ActionKind>, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Build an action from a JSON object literal; non-object values yield empty data.
    pub fn with_json(kind: impl Into<ActionKind>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(kind, data)
    }

    /// String field from the data bag, if present and a string.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Outcome of one action execution, forwarded to the client unmodified as
/// the `action` envelope payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_type: ActionKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(action_type: impl Into<ActionKind>, data: Option<Value>) -> Self {
        Self {
            action_type: action_type.into(),
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(action_type: impl Into<ActionKind>, error: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}
