use tracing::Level;

/// Render a base level plus per-module overrides as an `EnvFilter` directive
/// string, e.g. `info,pika_server::session=debug`.
pub fn directives(base: Level, module_levels: &[(String, Level)]) -> String {
    let mut out = level_str(base).to_string();
    for (module, level) in module_levels {
        out.push(',');
        out.push_str(module);
        out.push('=');
        out.push_str(level_str(*level));
    }
    out
}

/// Insert or replace an override for `module`.
pub fn upsert(levels: &mut Vec<(String, Level)>, module: &str, level: Level) {
    if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
        entry.1 = level;
    } else {
        levels.push((module.to_string(), level));
    }
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}
