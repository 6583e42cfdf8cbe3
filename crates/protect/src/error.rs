use std::{error::Error, fmt::Display};

/// Result type for protection operations.
pub type ProtectResult<T> = Result<T, ProtectError>;

/// Errors that abort the processing of a whole message.
#[derive(Debug)]
pub enum ProtectError {
    /// The message declares a multipart body without a `boundary=` parameter.
    MissingBoundary,
    /// A URL token could not be sealed or opened.
    Encryption(String),
}

impl Display for ProtectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtectError::MissingBoundary => write!(f, "Missing boundary for multipart message"),
            ProtectError::Encryption(msg) => write!(f, "Encryption error: {msg}"),
        }
    }
}

impl Error for ProtectError {}
