use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConntrackError {
    #[error("timeout '{field}' must be non-zero")]
    InvalidTimeout { field: &'static str },
}
