use thiserror::Error;

use crate::conntrack::error::ConntrackError;
use crate::nat::error::NatError;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("map access failed: {0}")]
    MapError(String),

    #[error("sweep failed: {0}")]
    SweepError(String),
}

impl From<ConntrackError> for DomainError {
    fn from(err: ConntrackError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

impl From<NatError> for DomainError {
    fn from(err: NatError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}
