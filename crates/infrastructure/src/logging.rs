use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, LogFormat, LogLevel};

/// Install the global tracing subscriber for the agent.
///
/// `RUST_LOG` overrides the configured level when present, so a single
/// node can be turned up to `debug` without touching its config file.
/// JSON output is flattened for log aggregators; text output is the
/// pretty development format. Call once, before the first datapath
/// attach, so load-time diagnostics are captured.
pub fn init_logging(level: LogLevel, format: LogFormat) -> Result<(), ConfigError> {
    let filter = env_filter(level);

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(filter)
            .with_target(true)
            .with_ansi(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }

    tracing::info!(
        level = level.as_str(),
        format = format.as_str(),
        "logging initialized"
    );
    Ok(())
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}
