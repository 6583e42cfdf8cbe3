//! In-pipeline email message transformations.
//!
//! Transformers run after the SMTP `DATA` phase and before delivery,
//! allowing trace headers to be injected or the message body to be
//! rewritten in place. Concrete implementations live in the
//! [`transformers`](crate::transformers) module.

use std::{error::Error, fmt::Display, future::Future, pin::Pin};

use tracing::debug;

use crate::EmailMessage;

/// Result type for transformer operations.
pub type TransformResult<T> = Result<T, TransformError>;

/// Boxed future type for transformer operations, enabling async transformers.
pub type TransformFuture<'a> = Pin<Box<dyn Future<Output = TransformResult<()>> + Send + 'a>>;

/// Errors that stop a message in the pipeline.
#[derive(Debug)]
pub enum TransformError {
    /// The message could not be processed and must not be delivered.
    Rejected(String),
}

impl Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::Rejected(msg) => write!(f, "Message rejected: {msg}"),
        }
    }
}

impl Error for TransformError {}

/// Trait for message transformers that modify emails in the pipeline.
pub trait MessageTransformer: Send + Sync {
    /// Transforms an email message in place, possibly performing async operations.
    fn transform<'a>(&'a self, message: &'a mut EmailMessage) -> TransformFuture<'a>;

    /// Returns the name of this transformer.
    fn name(&self) -> &str;
}

/// Applies a list of transformers to a message in order, stopping at the
/// first failure, and rebuilds the cached serialization.
pub async fn apply_transformers(
    transformers: &[Box<dyn MessageTransformer>],
    message: &mut EmailMessage,
) -> TransformResult<()> {
    for transformer in transformers {
        debug!(
            message_id = %message.message_id,
            transformer = transformer.name(),
            "Applying transformer"
        );
        transformer.transform(message).await?;
    }
    message.rebuild();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HeaderTransformer;

    impl MessageTransformer for HeaderTransformer {
        fn transform<'a>(&'a self, message: &'a mut EmailMessage) -> TransformFuture<'a> {
            Box::pin(async move {
                message.prepend_header("X-Seen", "yes");
                Ok(())
            })
        }

        fn name(&self) -> &str {
            "header"
        }
    }

    struct RejectingTransformer;

    impl MessageTransformer for RejectingTransformer {
        fn transform<'a>(&'a self, _message: &'a mut EmailMessage) -> TransformFuture<'a> {
            Box::pin(async { Err(TransformError::Rejected("nope".to_string())) })
        }

        fn name(&self) -> &str {
            "reject"
        }
    }

    #[tokio::test]
    async fn test_apply_transformers_rebuilds() {
        let transformers: Vec<Box<dyn MessageTransformer>> = vec![Box::new(HeaderTransformer)];
        let mut message =
            EmailMessage::from_raw("a@example.com", &["b@example.com"], "Subject: T\r\n\r\nBody");

        apply_transformers(&transformers, &mut message).await.unwrap();

        assert!(message.raw().starts_with("X-Seen: yes\r\nSubject: T\r\n"));
    }

    #[tokio::test]
    async fn test_apply_transformers_stops_on_error() {
        let transformers: Vec<Box<dyn MessageTransformer>> =
            vec![Box::new(RejectingTransformer), Box::new(HeaderTransformer)];
        let mut message =
            EmailMessage::from_raw("a@example.com", &["b@example.com"], "Subject: T\r\n\r\nBody");

        let result = apply_transformers(&transformers, &mut message).await;

        assert!(matches!(result, Err(TransformError::Rejected(_))));
        assert!(message.header("X-Seen").is_none());
    }

    #[test]
    fn test_transform_error_display() {
        assert_eq!(
            TransformError::Rejected("bad".to_string()).to_string(),
            "Message rejected: bad"
        );
    }
}
