//! Reputation collaborators consulted before a message is relayed.
//!
//! [`UrlScanner`] and [`FileScanner`] are the seams between the protector
//! and the external reputation services. The HTTP clients implementing them
//! live in the submodules, tests plug in-memory implementations instead.

mod file_scanner;
mod web_filter;

use std::{error::Error, fmt::Display, future::Future, pin::Pin};

use serde::Deserialize;

pub use file_scanner::{FileScannerClient, NoopFileScanner};
pub use web_filter::WebFilterClient;

/// Result type for reputation lookups.
pub type ScanResult<T> = Result<T, ScanError>;

/// Boxed future type for scanner operations, enabling object safety.
pub type ScanFuture<'a, T> = Pin<Box<dyn Future<Output = ScanResult<T>> + Send + 'a>>;

/// Errors raised while talking to a reputation service.
#[derive(Debug)]
pub enum ScanError {
    /// The request could not be sent or its body not read.
    Http(String),
    /// The service answered with a status other than `200 OK`.
    Status(u16),
    /// The response body is not the expected JSON document.
    Decode(String),
}

impl Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Http(msg) => write!(f, "HTTP error: {msg}"),
            ScanError::Status(status) => write!(f, "Received a non 200 status: {status}"),
            ScanError::Decode(msg) => write!(f, "Decode error: {msg}"),
        }
    }
}

impl Error for ScanError {}

/// Verdict of a file reputation lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ScanVerdict {
    Clean,
    Malicious,
    /// The hash is not known to the service, a full content scan is needed.
    Unknown,
}

impl ScanVerdict {
    pub fn is_malicious(&self) -> bool {
        *self == ScanVerdict::Malicious
    }
}

/// One entry of a URL reputation report, a non zero `status_code` flags
/// the URL as malicious.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlReport {
    pub status_code: i64,
    pub status_message: Vec<String>,
    pub domain_grey: bool,
}

impl UrlReport {
    pub fn is_malicious(&self) -> bool {
        self.status_code != 0
    }
}

/// Reputation service for links found in message bodies.
pub trait UrlScanner: Send + Sync {
    fn scan_url<'a>(&'a self, url: &'a str) -> ScanFuture<'a, Vec<UrlReport>>;

    fn name(&self) -> &str;
}

/// Reputation service for attachments, by content hash or full content.
pub trait FileScanner: Send + Sync {
    fn scan_file_hash<'a>(&'a self, file_name: &'a str, sha256: &'a str)
        -> ScanFuture<'a, ScanVerdict>;

    fn scan_file<'a>(&'a self, file_name: &'a str, bytes: &'a [u8]) -> ScanFuture<'a, ScanVerdict>;

    fn name(&self) -> &str;
}

/// Scanner used when no URL reputation service is configured, links are
/// still rewritten but every one of them is reported clean.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUrlScanner;

impl UrlScanner for NoopUrlScanner {
    fn scan_url<'a>(&'a self, _url: &'a str) -> ScanFuture<'a, Vec<UrlReport>> {
        Box::pin(async { Ok(vec![UrlReport::default()]) })
    }

    fn name(&self) -> &str {
        "noop"
    }
}

fn map_http_error(error: reqwest::Error) -> ScanError {
    ScanError::Http(error.to_string())
}

/// Ensures a `200 OK` answer and decodes its JSON body.
async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> ScanResult<T> {
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(ScanError::Status(status.as_u16()));
    }
    let body = response.bytes().await.map_err(map_http_error)?;
    serde_json::from_slice(&body).map_err(|e| ScanError::Decode(e.to_string()))
}
