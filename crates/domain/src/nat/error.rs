use thiserror::Error;

#[derive(Debug, Error)]
pub enum NatError {
    #[error("service '{name}': {message}")]
    InvalidService { name: String, message: String },
}
