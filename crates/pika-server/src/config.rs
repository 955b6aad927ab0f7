//! Server configuration with file overlay and environment overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `PIKA_*` environment overrides (highest priority below CLI flags)

use std::path::{Path, PathBuf};
use std::time::Duration;

use pika_telemetry::{LogFormat, TelemetryConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, Level};

use crate::error::ServerError;
use crate::nudge::NudgeSettings;
use crate::session::{SessionConfig, MAX_MESSAGE_SIZE, SEND_QUEUE_CAPACITY};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub send_queue_capacity: usize,
    pub max_message_size: usize,
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
    pub nudge: NudgeConfig,
    pub telemetry: TelemetrySettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            send_queue_capacity: SEND_QUEUE_CAPACITY,
            max_message_size: MAX_MESSAGE_SIZE,
            pong_wait_secs: 60,
            write_wait_secs: 10,
            nudge: NudgeConfig::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Transport tuning for each session. The ping period is 9/10 of the
    /// pong wait so a ping always lands before the read deadline.
    pub fn session_config(&self) -> SessionConfig {
        let pong_wait = Duration::from_secs(self.pong_wait_secs.max(1));
        SessionConfig {
            send_queue_capacity: self.send_queue_capacity.max(1),
            max_message_size: self.max_message_size,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(self.write_wait_secs.max(1)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NudgeConfig {
    pub enabled: bool,
    pub idle_threshold_secs: u64,
    pub cooldown_secs: u64,
    pub check_interval_secs: u64,
}

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_threshold_secs: 600,
            cooldown_secs: 1800,
            check_interval_secs: 60,
        }
    }
}

impl NudgeConfig {
    pub fn settings(&self) -> NudgeSettings {
        NudgeSettings {
            idle_threshold: Duration::from_secs(self.idle_threshold_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
            check_interval: Duration::from_secs(self.check_interval_secs.max(1)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl TelemetrySettings {
    /// Unknown level names fall back to `info`.
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: parse_level(&self.level).unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            format: self.format,
        }
    }
}

/// Resolve the path to the settings file (`~/.pika/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".pika").join("settings.json")
}

/// Load configuration. An explicit path must exist; the default path is
/// optional.
pub fn load(explicit: Option<&Path>) -> Result<ServerConfig, ServerError> {
    let mut config = match explicit {
        Some(path) if !path.exists() => {
            return Err(ServerError::Config(format!(
                "settings file not found: {}",
                path.display()
            )));
        }
        Some(path) => load_file(path)?,
        None => load_file(&settings_path())?,
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Defaults with the file at `path` merged over them, if it exists.
/// Environment overrides are not applied.
pub fn load_file(path: &Path) -> Result<ServerConfig, ServerError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge: objects merge per key, everything else is
/// replaced, nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PIKA_*` overrides read through `lookup`. Invalid values are
/// logged and ignored.
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("PIKA_HOST") {
        config.host = v;
    }
    if let Some(v) = env.parsed("PIKA_PORT", |s| parse_u16_range(s, 1, 65535)) {
        config.port = v;
    }
    if let Some(v) = env.parsed("PIKA_SEND_QUEUE", |s| parse_usize_range(s, 1, 1 << 20)) {
        config.send_queue_capacity = v;
    }
    if let Some(v) = env.parsed("PIKA_LOG_LEVEL", |s| parse_level(s).map(|_| s.to_lowercase())) {
        config.telemetry.level = v;
    }
    if let Some(v) = env.parsed("PIKA_LOG_FORMAT", |s| s.parse::<LogFormat>().ok()) {
        config.telemetry.format = v;
    }
    if let Some(v) = env.parsed("PIKA_NUDGE_ENABLED", parse_bool) {
        config.nudge.enabled = v;
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(val.trim());
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_level(val: &str) -> Option<Level> {
    val.trim().parse().ok()
}
