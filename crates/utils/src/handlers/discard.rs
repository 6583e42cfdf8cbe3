use tracing::info;

use crate::{
    handler::{HandlerFuture, MessageHandler},
    EmailMessage,
};

/// Message handler that accepts and drops every message.
#[derive(Debug, Default)]
pub struct DiscardHandler;

impl MessageHandler for DiscardHandler {
    fn handle<'a>(&'a self, message: &'a EmailMessage) -> HandlerFuture<'a> {
        Box::pin(async move {
            info!(
                message_id = %message.message_id,
                from = %message.from,
                size = message.raw().len(),
                "Discarded email"
            );
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "discard"
    }
}
