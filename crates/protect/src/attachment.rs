use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{codec::is_base64_line, FileScanner, ScanVerdict, Section, TransferEncoding};

/// Decoded content of an attachment part, ready for a reputation lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPayload {
    pub file_name: String,
    /// Lowercase hex SHA-256 of `bytes`.
    pub sha256: String,
    pub bytes: Vec<u8>,
}

/// Runs the two phase reputation check for attachment sections, a hash
/// lookup first and a full content scan when the hash is unknown.
pub struct AttachmentInspector<'a> {
    scanner: &'a dyn FileScanner,
}

impl<'a> AttachmentInspector<'a> {
    pub fn new(scanner: &'a dyn FileScanner) -> Self {
        Self { scanner }
    }

    /// Extracts the raw bytes of an attachment section.
    ///
    /// Delimiter and epilogue lines kept at the tail of the last part are
    /// left out. Base64 payloads that fail to decode, and parts with any
    /// other transfer encoding, are used as their still encoded bytes.
    pub fn payload(section: &Section) -> AttachmentPayload {
        let bytes = match section.content_transfer_encoding {
            TransferEncoding::Base64 => {
                let encoded = base64_body(&section.data);
                general_purpose::STANDARD
                    .decode(&encoded)
                    .unwrap_or_else(|error| {
                        warn!(
                            file_name = ?section.attachment_file_name,
                            error = %error,
                            "Failed to decode attachment, using raw content"
                        );
                        encoded.into_bytes()
                    })
            }
            encoding => {
                warn!(
                    file_name = ?section.attachment_file_name,
                    encoding = encoding.name(),
                    "Unsupported attachment encoding, using raw content"
                );
                raw_body(&section.data).into_bytes()
            }
        };

        let sha256 = hex::encode(Sha256::digest(&bytes));
        let file_name = section
            .attachment_file_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| sha256.clone());
        AttachmentPayload {
            file_name,
            sha256,
            bytes,
        }
    }

    /// Returns whether the attachment is malicious. Lookup failures are
    /// logged and count as clean.
    pub async fn inspect(&self, section: &Section) -> bool {
        self.inspect_payload(&Self::payload(section)).await
    }

    /// Runs the lookup for an already extracted payload.
    pub async fn inspect_payload(&self, payload: &AttachmentPayload) -> bool {
        debug!(
            file_name = %payload.file_name,
            sha256 = %payload.sha256,
            size = payload.bytes.len(),
            scanner = self.scanner.name(),
            "Inspecting attachment"
        );

        let verdict = match self
            .scanner
            .scan_file_hash(&payload.file_name, &payload.sha256)
            .await
        {
            Ok(ScanVerdict::Unknown) => {
                match self.scanner.scan_file(&payload.file_name, &payload.bytes).await {
                    Ok(verdict) => verdict,
                    Err(error) => {
                        warn!(file_name = %payload.file_name, error = %error, "Failed to scan file");
                        return false;
                    }
                }
            }
            Ok(verdict) => verdict,
            Err(error) => {
                warn!(file_name = %payload.file_name, error = %error, "Failed to scan file hash");
                return false;
            }
        };

        debug!(file_name = %payload.file_name, verdict = ?verdict, "Attachment verdict");
        verdict.is_malicious()
    }
}

/// Joins the base64 lines of a part body, skipping leading sub-headers and
/// stopping at the first line after the payload that is not base64.
fn base64_body(data: &str) -> String {
    let mut encoded = String::with_capacity(data.len());
    for line in data.lines() {
        let line = line.trim();
        if is_base64_line(line) {
            encoded.push_str(line);
        } else if !encoded.is_empty() && !line.is_empty() {
            break;
        }
    }
    encoded
}

fn raw_body(data: &str) -> String {
    let mut body = String::with_capacity(data.len());
    for line in data.lines() {
        if is_closing_delimiter(line) {
            break;
        }
        body.push_str(line);
        body.push('\n');
    }
    body
}

fn is_closing_delimiter(line: &str) -> bool {
    let line = line.trim_end();
    line.len() > 4 && line.starts_with("--") && line.ends_with("--")
}
