use std::sync::Arc;

use mailshield_protect::MessageProtector;
use tracing::{error, info, warn};

use crate::{EmailMessage, MessageTransformer, TransformError, TransformFuture};

/// Transformer that defangs the links of a message and marks it when a
/// link or attachment is reported malicious.
///
/// A message whose structure cannot be processed is rejected rather than
/// relayed unprotected.
pub struct ProtectionTransformer {
    protector: Arc<MessageProtector>,
}

impl ProtectionTransformer {
    pub fn new(protector: Arc<MessageProtector>) -> Self {
        Self { protector }
    }
}

impl MessageTransformer for ProtectionTransformer {
    fn transform<'a>(&'a self, message: &'a mut EmailMessage) -> TransformFuture<'a> {
        Box::pin(async move {
            let protected = self.protector.protect(message.raw()).await.map_err(|e| {
                error!(
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to protect message"
                );
                TransformError::Rejected(e.to_string())
            })?;

            if protected.marked {
                warn!(
                    message_id = %message.message_id,
                    from = %message.from,
                    header = %self.protector.marker_header(),
                    "Marked malicious message"
                );
            }
            info!(
                message_id = %message.message_id,
                urls = protected.urls.len(),
                attachments = protected.attachments,
                marked = protected.marked,
                "Applied message protection"
            );
            message.set_raw(protected.raw);
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "protection"
    }
}
