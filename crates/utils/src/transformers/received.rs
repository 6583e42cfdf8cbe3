use chrono::Utc;
use tracing::{debug, info};

use crate::{EmailMessage, MessageTransformer, TransformFuture};

/// Transformer that prepends a `Received` trace header (RFC 5321 section 4.4).
///
/// The header names the HELO domain and IP of the client, the relay
/// hostname and the relay message id.
pub struct ReceivedTransformer {
    hostname: String,
}

impl ReceivedTransformer {
    pub fn new(hostname: String) -> Self {
        info!(hostname = %hostname, "Received transformer initialized");
        Self { hostname }
    }

    fn value(&self, message: &EmailMessage) -> String {
        let helo = message.helo_domain.as_deref().unwrap_or("unknown");
        let ip = message
            .client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "from {helo} ({ip}) by {} with ESMTP id {}; {}",
            self.hostname,
            message.message_id,
            Utc::now().to_rfc2822()
        )
    }
}

impl MessageTransformer for ReceivedTransformer {
    fn transform<'a>(&'a self, message: &'a mut EmailMessage) -> TransformFuture<'a> {
        Box::pin(async move {
            let value = self.value(message);
            debug!(message_id = %message.message_id, "Injecting Received header");
            message.prepend_header("Received", &value);
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "received"
    }
}
