//! Core email message types used throughout the relay pipeline.
//!
//! This module defines [`EmailMessage`], the representation of an email
//! with structured [RFC 5322](https://www.rfc-editor.org/rfc/rfc5322)
//! headers, cached serialization and its SMTP envelope. It also defines
//! [`IncomingMessage`], the envelope and data as received by the listener.

use std::net::IpAddr;

use uuid::Uuid;

use crate::{decode_data, encode_data, parse_raw_headers, DataEncoding};

/// An email travelling through the relay together with its envelope.
///
/// Headers are stored as an ordered `Vec` (preserving RFC 5322 order and
/// supporting duplicate headers such as `Received`). A cached `raw` field
/// holds the full serialized form; call [`rebuild`](Self::rebuild) after
/// modifying headers so that [`raw`](Self::raw) reflects the changes.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    /// Identifier of the message inside the relay, used in logs and `Received`.
    pub message_id: String,

    /// Envelope sender, empty for bounces.
    pub from: String,

    /// Envelope recipients in the order they were given.
    pub rcpts: Vec<String>,

    /// IP address of the connecting SMTP client.
    pub client_ip: Option<IpAddr>,

    /// HELO/EHLO domain presented by the connecting client.
    pub helo_domain: Option<String>,

    /// Mapping between the received bytes and `raw`, used again on delivery.
    pub data_encoding: DataEncoding,

    headers: Vec<(String, String)>,

    body: String,

    raw: String,

    /// Data as received, never modified after construction.
    original_raw: String,
}

impl EmailMessage {
    pub fn new(from: String, rcpts: Vec<String>, raw: String) -> Self {
        let message_id = Uuid::new_v4().to_string();
        let (headers, content) = parse_raw_headers(&raw);
        Self {
            message_id,
            from,
            rcpts,
            headers,
            body: content.to_string(),
            raw: raw.clone(),
            original_raw: raw,
            client_ip: None,
            helo_domain: None,
            data_encoding: DataEncoding::Utf8,
        }
    }

    pub fn from_raw(from: &str, rcpts: &[&str], raw: &str) -> Self {
        Self::new(
            from.to_string(),
            rcpts.iter().map(|rcpt| rcpt.to_string()).collect(),
            raw.to_string(),
        )
    }

    /// Returns the recipient routing decisions are keyed on.
    pub fn first_rcpt(&self) -> &str {
        self.rcpts.first().map(String::as_str).unwrap_or_default()
    }

    /// Returns the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn subject(&self) -> &str {
        self.header("Subject").unwrap_or_default()
    }

    /// Returns the full serialized email (headers + blank line + content).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Returns the serialized email as bytes for the wire, 8-bit data is
    /// written back exactly as it was received.
    pub fn raw_bytes(&self) -> Vec<u8> {
        encode_data(&self.raw, self.data_encoding)
    }

    /// Returns the data as received, before any transformer modifications.
    pub fn original_raw(&self) -> &str {
        &self.original_raw
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn has_headers(&self) -> bool {
        !self.headers.is_empty()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Prepends a header to the beginning of the header list.
    ///
    /// The cached [`raw`](Self::raw) field is **not** updated automatically, call
    /// [`rebuild`](Self::rebuild) once after all header modifications are done.
    pub fn prepend_header(&mut self, name: &str, value: &str) {
        self.headers.insert(0, (name.to_string(), value.to_string()));
    }

    /// Replaces the whole message, headers and body are parsed again.
    pub fn set_raw(&mut self, raw: String) {
        let (headers, content) = parse_raw_headers(&raw);
        self.headers = headers;
        self.body = content.to_string();
        self.raw = raw;
    }

    /// Rebuilds the cached [`raw`](Self::raw) field from the headers and the body.
    ///
    /// Pre-computes the exact byte length, allocates once, and writes all
    /// parts via `push_str`.
    pub fn rebuild(&mut self) {
        let headers_len: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + 2 + v.len() + 2)
            .sum();

        let capacity = headers_len + if self.headers.is_empty() { 0 } else { 2 } + self.body.len();

        let mut raw = String::with_capacity(capacity);

        for (key, value) in &self.headers {
            raw.push_str(key);
            raw.push_str(": ");
            raw.push_str(value);
            raw.push_str("\r\n");
        }

        if !self.headers.is_empty() {
            raw.push_str("\r\n");
        }

        raw.push_str(&self.body);

        self.raw = raw;
    }
}

/// A message as accepted by the SMTP listener.
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    /// Envelope sender address.
    pub from: String,

    /// Envelope recipients, deduplicated, in the order they were given.
    pub rcpts: Vec<String>,

    /// Raw message data (headers + content), any bytes allowed.
    pub raw: Vec<u8>,

    pub client_ip: Option<IpAddr>,

    pub helo_domain: Option<String>,
}

impl IncomingMessage {
    /// Creates the [`EmailMessage`] that goes through the pipeline.
    pub fn to_email_message(&self) -> EmailMessage {
        let (raw, data_encoding) = decode_data(self.raw.clone());
        let mut message = EmailMessage::new(self.from.clone(), self.rcpts.clone(), raw);
        message.data_encoding = data_encoding;
        message.client_ip = self.client_ip;
        message.helo_domain = self.helo_domain.clone();
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_message_new() {
        let message = EmailMessage::new(
            "sender@example.com".to_string(),
            vec!["recipient@example.com".to_string()],
            "Subject: Hello\r\n\r\nBody text".to_string(),
        );

        assert_eq!(message.from, "sender@example.com");
        assert_eq!(message.first_rcpt(), "recipient@example.com");
        assert_eq!(message.subject(), "Hello");
        assert_eq!(message.body(), "Body text");
        assert_eq!(message.raw(), "Subject: Hello\r\n\r\nBody text");
    }

    #[test]
    fn test_email_message_no_headers() {
        let message = EmailMessage::from_raw("from@test.com", &["to@test.com"], "Plain text body");

        assert!(!message.has_headers());
        assert_eq!(message.subject(), "");
        assert_eq!(message.body(), "Plain text body");
    }

    #[test]
    fn test_email_message_without_rcpts() {
        let message = EmailMessage::from_raw("from@test.com", &[], "Body");
        assert_eq!(message.first_rcpt(), "");
    }

    #[test]
    fn test_email_message_prepend_header_and_rebuild() {
        let mut message =
            EmailMessage::from_raw("from@test.com", &["to@test.com"], "Subject: Test\r\n\r\nBody");

        message.prepend_header("X-Custom", "value");
        message.rebuild();

        assert!(message.raw().starts_with("X-Custom: value\r\n"));
        assert!(message.raw().contains("Subject: Test"));
        assert!(message.raw().ends_with("Body"));
    }

    #[test]
    fn test_rebuild_keeps_folded_headers() {
        let raw = "Content-Type: multipart/mixed;\r\n\tboundary=\"X\"\r\nSubject: s\r\n\r\n--X--\r\n";
        let mut message = EmailMessage::from_raw("from@test.com", &["to@test.com"], raw);

        message.rebuild();

        assert_eq!(message.raw(), raw);
    }

    #[test]
    fn test_set_raw_reparses() {
        let mut message =
            EmailMessage::from_raw("from@test.com", &["to@test.com"], "Subject: Old\r\n\r\nBody");

        message.set_raw("Subject: New\nX-Action: block\n\nOther body\n".to_string());

        assert_eq!(message.subject(), "New");
        assert_eq!(message.header("x-action"), Some("block"));
        assert_eq!(message.body(), "Other body\n");
        assert_eq!(message.original_raw(), "Subject: Old\r\n\r\nBody");
    }

    #[test]
    fn test_incoming_message_to_email_message() {
        let incoming = IncomingMessage {
            from: "sender@example.com".to_string(),
            rcpts: vec![
                "alice@example.com".to_string(),
                "bob@example.com".to_string(),
            ],
            raw: b"Subject: Test\r\n\r\nBody".to_vec(),
            client_ip: Some("127.0.0.1".parse().unwrap()),
            helo_domain: Some("mail.example.com".to_string()),
        };

        let message = incoming.to_email_message();

        assert_eq!(message.from, "sender@example.com");
        assert_eq!(message.rcpts, incoming.rcpts);
        assert_eq!(message.first_rcpt(), "alice@example.com");
        assert_eq!(message.raw(), "Subject: Test\r\n\r\nBody");
        assert_eq!(message.data_encoding, DataEncoding::Utf8);
        assert_eq!(message.client_ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(message.helo_domain, Some("mail.example.com".to_string()));
    }

    #[test]
    fn test_incoming_message_generates_unique_ids() {
        let incoming = IncomingMessage {
            from: "sender@example.com".to_string(),
            rcpts: vec!["rcpt@example.com".to_string()],
            raw: b"Body".to_vec(),
            ..Default::default()
        };

        let first = incoming.to_email_message();
        let second = incoming.to_email_message();

        assert_ne!(first.message_id, second.message_id);
    }

    #[test]
    fn test_eight_bit_data_round_trips() {
        let incoming = IncomingMessage {
            from: "sender@example.com".to_string(),
            rcpts: vec!["rcpt@example.com".to_string()],
            raw: b"Subject: caf\xe9\r\n\r\nna\xefve \xff\r\n".to_vec(),
            ..Default::default()
        };

        let mut message = incoming.to_email_message();
        assert_eq!(message.data_encoding, DataEncoding::Latin1);
        assert_eq!(message.subject(), "caf\u{e9}");
        assert_eq!(message.raw_bytes(), incoming.raw);

        message.prepend_header("X-Relay", "1");
        message.rebuild();
        assert_eq!(
            message.raw_bytes(),
            b"X-Relay: 1\r\nSubject: caf\xe9\r\n\r\nna\xefve \xff\r\n"
        );
    }
}
