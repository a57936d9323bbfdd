//! Error types for the clicky core library.

use thiserror::Error;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types.
#[derive(Debug, Error)]
pub enum Error {
    /// An engine event line that is not a JSON object
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
