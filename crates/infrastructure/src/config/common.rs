//! Shared parsing helpers and error types used across the config module.

use domain::common::entity::Cidr;
use serde::{Deserialize, Serialize};

// ── Config errors ──────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(String),

    #[error("validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("invalid CIDR notation '{value}': {reason}")]
    InvalidCidr { value: String, reason: String },

    #[error("invalid value '{value}' for field '{field}': expected one of {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

impl From<serde_yaml_ng::Error> for ConfigError {
    fn from(e: serde_yaml_ng::Error) -> Self {
        Self::Yaml(e.to_string())
    }
}

// ── Log level / format ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

// ── Parsing helpers ────────────────────────────────────────────────

/// Parse an IPv4 CIDR string like `"192.168.1.0/24"` or `"10.0.0.1"`.
pub fn parse_cidr(s: &str) -> Result<Cidr, ConfigError> {
    let (ip_str, prefix_len) = match s.split_once('/') {
        Some((ip, prefix)) => {
            let len = prefix.parse::<u8>().map_err(|_| ConfigError::InvalidCidr {
                value: s.to_string(),
                reason: format!("invalid prefix length: '{prefix}'"),
            })?;
            if len > 32 {
                return Err(ConfigError::InvalidCidr {
                    value: s.to_string(),
                    reason: format!("prefix length {len} must be 0-32"),
                });
            }
            (ip, len)
        }
        None => (s, 32),
    };

    let addr: std::net::Ipv4Addr = ip_str.parse().map_err(|_| ConfigError::InvalidCidr {
        value: s.to_string(),
        reason: "invalid IPv4 address".to_string(),
    })?;

    Ok(Cidr {
        addr: u32::from(addr),
        prefix_len,
    })
}

pub(super) fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cidr_with_prefix() {
        let cidr = parse_cidr("192.168.1.0/24").unwrap();
        assert_eq!(cidr.addr, 0xC0A8_0100);
        assert_eq!(cidr.prefix_len, 24);
    }

    #[test]
    fn parse_cidr_single_host() {
        let cidr = parse_cidr("10.0.0.1").unwrap();
        assert_eq!(cidr.addr, 0x0A00_0001);
        assert_eq!(cidr.prefix_len, 32);
    }

    #[test]
    fn parse_cidr_zero() {
        let cidr = parse_cidr("0.0.0.0/0").unwrap();
        assert_eq!(cidr.addr, 0);
        assert_eq!(cidr.prefix_len, 0);
    }

    #[test]
    fn parse_cidr_invalid() {
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("10.0.0").is_err());
        assert!(parse_cidr("256.0.0.0/24").is_err());
        assert!(parse_cidr("not-an-ip").is_err());
    }

    #[test]
    fn log_level_strings() {
        assert_eq!(LogLevel::Info.as_str(), "info");
        assert_eq!(LogFormat::Json.as_str(), "json");
    }
}
