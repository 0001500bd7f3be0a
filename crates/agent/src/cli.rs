use clap::Parser;
use infrastructure::config::{LogFormat, LogLevel};

#[derive(Debug, Parser)]
#[command(name = "flowgate-agent", about = "eBPF network policy and service NAT datapath agent")]
pub struct Cli {
    /// Path to the agent configuration file.
    #[arg(short, long, default_value = "/etc/flowgate/config.yaml")]
    pub config: String,

    /// Override the configured log level (error|warn|info|debug|trace).
    #[arg(long, value_parser = parse_log_level)]
    pub log_level: Option<LogLevel>,

    /// Override the configured log format (text|json).
    #[arg(long, value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,

    /// Print the version and exit.
    #[arg(long)]
    pub version: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

fn parse_log_level(s: &str) -> Result<LogLevel, String> {
    match s.to_lowercase().as_str() {
        "error" => Ok(LogLevel::Error),
        "warn" => Ok(LogLevel::Warn),
        "info" => Ok(LogLevel::Info),
        "debug" => Ok(LogLevel::Debug),
        "trace" => Ok(LogLevel::Trace),
        other => Err(format!("unknown log level '{other}'")),
    }
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_parsing() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), LogLevel::Debug);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!(parse_log_format("json").unwrap(), LogFormat::Json);
        assert!(parse_log_format("xml").is_err());
    }
}
