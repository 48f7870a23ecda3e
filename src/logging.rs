use chrono::{SecondsFormat, Utc};
use log::LevelFilter;
use serde_json::json;
use std::env;
use std::io::Write;

use crate::config::{LogFormat, Settings};

/// Installs the global logger. `RUST_LOG`, when set, overrides the configured
/// level. Calling this again is a no-op.
pub fn init(settings: &Settings) {
    init_with(settings.log_level, settings.log_format);
}

pub fn init_with(level: LevelFilter, format: LogFormat) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    // sqlx logs every statement at info
    builder.filter_module("sqlx", LevelFilter::Warn);
    if let Ok(filters) = env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    match format {
        LogFormat::Pretty => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "{} {:<5} [{}] {}",
                    Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    record.args()
                )
            });
        }
        LogFormat::Json => {
            builder.format(|buf, record| {
                let line = json!({
                    "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                    "level": record.level().as_str().to_lowercase(),
                    "logger": record.target(),
                    "event": record.args().to_string(),
                });
                writeln!(buf, "{}", line)
            });
        }
    }

    if builder.try_init().is_ok() {
        log::debug!("Logging initialised at {} ({:?})", level, format);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_with(LevelFilter::Debug, LogFormat::Json);
        init_with(LevelFilter::Info, LogFormat::Pretty);
        log::info!("still logging");
    }
}
