/*!
 * Error types for the OpenTherm engine crate.
 */
use thiserror::Error;

/// Error type for OpenTherm engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] opentherm_core::error::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// The controller is no longer running
    #[error("Command channel closed")]
    ChannelClosed,
}

/// Result type for OpenTherm engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new validation error
    pub fn validation<S: AsRef<str>>(msg: S) -> Self {
        Error::Validation(msg.as_ref().to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
