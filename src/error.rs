use thiserror::Error;

/// Error type for workpool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Settings validation failed at construction time.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// A best-effort operation could not complete without blocking.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Result type alias for workpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
