//! Process-wide logger setup.
//!
//! Call [`init`] once from `main` before the server starts. Handlers only use
//! the `log` macros and never touch logger state.

use std::io::Write;

use env_logger::{Builder, Target};
use log::{Level, LevelFilter, Record};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Installs the global logger.
///
/// `console` selects env_logger's human-readable stderr output; otherwise
/// one JSON object per line is written to stdout with `time`, `severity`
/// and `message` fields. `RUST_LOG` still overrides `level` per target.
pub fn init(level: LevelFilter, console: bool) -> Result<(), log::SetLoggerError> {
    let mut builder = Builder::new();
    builder.filter_level(level).parse_default_env();
    if console {
        builder.target(Target::Stderr);
    } else {
        builder
            .target(Target::Stdout)
            .format(|buf, record| writeln!(buf, "{}", json_entry(record)));
    }
    builder.try_init()
}

pub fn json_entry(record: &Record<'_>) -> Value {
    let time = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
    json!({
        "time": time,
        "severity": severity(record.level()),
        "message": record.args().to_string(),
        "target": record.target(),
    })
}

fn severity(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARNING",
        Level::Info => "INFO",
        Level::Debug | Level::Trace => "DEBUG",
    }
}

#[cfg(test)]
mod tests {
    use super::json_entry;
    use log::{Level, Record};

    #[test]
    fn json_entry_uses_cloud_severity_names() {
        let entry = json_entry(
            &Record::builder()
                .args(format_args!("stream closed peer={}", "alpha"))
                .level(Level::Warn)
                .target("trisa_node::service")
                .build(),
        );
        assert_eq!(entry["severity"], "WARNING");
        assert_eq!(entry["message"], "stream closed peer=alpha");
        assert_eq!(entry["target"], "trisa_node::service");
        assert!(entry["time"].as_str().is_some_and(|t| !t.is_empty()));
    }
}
