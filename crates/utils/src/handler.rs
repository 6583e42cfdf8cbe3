use std::{error::Error, fmt::Display, future::Future, pin::Pin};

use crate::{EmailMessage, TransformError};

/// Result type for handler operations.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Boxed future type for handler operations, enabling object safety.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult<()>> + Send + 'a>>;

/// Errors that can occur during message handling.
#[derive(Debug)]
pub enum HandlerError {
    /// The upstream server could not be reached or set up.
    Connection(String),
    /// The upstream server refused the message.
    Delivery(String),
    /// The envelope addresses are not valid for delivery.
    Envelope(String),
    /// A pipeline step refused the message before delivery.
    Rejected(String),
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Connection(msg) => write!(f, "Connection error: {msg}"),
            HandlerError::Delivery(msg) => write!(f, "Delivery error: {msg}"),
            HandlerError::Envelope(msg) => write!(f, "Envelope error: {msg}"),
            HandlerError::Rejected(msg) => write!(f, "Rejected: {msg}"),
        }
    }
}

impl Error for HandlerError {}

impl From<TransformError> for HandlerError {
    fn from(error: TransformError) -> Self {
        HandlerError::Rejected(error.to_string())
    }
}

/// Trait for message handlers, the final destination of a message in the
/// pipeline.
pub trait MessageHandler: Send + Sync {
    /// Handles an email message, resolving once the destination accepted it.
    fn handle<'a>(&'a self, message: &'a EmailMessage) -> HandlerFuture<'a>;

    /// Returns the name of this handler.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_display() {
        assert_eq!(
            HandlerError::Connection("test".to_string()).to_string(),
            "Connection error: test"
        );
        assert_eq!(
            HandlerError::Delivery("test".to_string()).to_string(),
            "Delivery error: test"
        );
        assert_eq!(
            HandlerError::Envelope("test".to_string()).to_string(),
            "Envelope error: test"
        );
    }

    #[test]
    fn test_handler_error_from_transform() {
        let error = HandlerError::from(TransformError::Rejected("boundary".to_string()));
        assert_eq!(error.to_string(), "Rejected: Message rejected: boundary");
    }
}
