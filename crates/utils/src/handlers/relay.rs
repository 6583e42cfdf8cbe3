use std::time::Duration;

use lettre::{
    address::{Address, Envelope},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};
use tracing::{debug, error, info};

use crate::{
    handler::{HandlerError, HandlerFuture, HandlerResult, MessageHandler},
    encode_data, normalize_crlf, EmailMessage, RelaySecurity,
};

const RELAY_TIMEOUT: Duration = Duration::from_secs(60);

/// Message handler that delivers emails to an upstream SMTP server with
/// their original envelope.
pub struct RelayHandler {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    port: u16,
}

impl RelayHandler {
    pub fn new(
        host: &str,
        port: u16,
        security: RelaySecurity,
        credentials: Option<(String, String)>,
    ) -> HandlerResult<Self> {
        let builder = match security {
            RelaySecurity::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
            RelaySecurity::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| HandlerError::Connection(e.to_string()))?,
            RelaySecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| HandlerError::Connection(e.to_string()))?,
        };
        let mut builder = builder.port(port).timeout(Some(RELAY_TIMEOUT));
        if let Some((username, password)) = credentials {
            builder = builder.credentials(Credentials::new(username, password));
        }

        info!(host = %host, port = port, security = ?security, "Relay handler initialized");
        Ok(Self {
            transport: builder.build(),
            host: host.to_string(),
            port,
        })
    }
}

/// Builds the SMTP envelope of a message, an empty sender is a null
/// reverse-path.
pub fn envelope(message: &EmailMessage) -> HandlerResult<Envelope> {
    let from = if message.from.is_empty() {
        None
    } else {
        Some(
            message
                .from
                .parse::<Address>()
                .map_err(|e| HandlerError::Envelope(format!("sender {}: {e}", message.from)))?,
        )
    };
    let to = message
        .rcpts
        .iter()
        .map(|rcpt| {
            rcpt.parse::<Address>()
                .map_err(|e| HandlerError::Envelope(format!("recipient {rcpt}: {e}")))
        })
        .collect::<HandlerResult<Vec<_>>>()?;
    Envelope::new(from, to).map_err(|e| HandlerError::Envelope(e.to_string()))
}

impl MessageHandler for RelayHandler {
    fn handle<'a>(&'a self, message: &'a EmailMessage) -> HandlerFuture<'a> {
        Box::pin(async move {
            let envelope = envelope(message)?;
            let data = encode_data(&normalize_crlf(message.raw()), message.data_encoding);
            debug!(
                message_id = %message.message_id,
                host = %self.host,
                port = self.port,
                size = data.len(),
                "Relaying email upstream"
            );

            let response = self
                .transport
                .send_raw(&envelope, &data)
                .await
                .map_err(|e| {
                    error!(
                        message_id = %message.message_id,
                        host = %self.host,
                        error = %e,
                        "Failed to relay email"
                    );
                    HandlerError::Delivery(e.to_string())
                })?;

            info!(
                message_id = %message.message_id,
                from = %message.from,
                rcpts = message.rcpts.len(),
                code = %response.code(),
                "Relayed email upstream"
            );
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "relay"
    }
}
