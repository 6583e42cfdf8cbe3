//! Message level orchestration of the rewrite and the reputation checks.

use std::{future::Future, sync::Arc};

use futures::{stream::FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    header_value, AttachmentInspector, AttachmentPayload, BodyProcessor, ContentRewriter,
    FileScanner, ProtectResult, Section, UrlScanner, UrlSet,
};

/// Header appended to messages found to be malicious.
pub const DEFAULT_MARKER_HEADER: &str = "X-Mailshield-Action";

/// Value of the marker header.
pub const MARKER_VALUE: &str = "block";

/// Number of reputation lookups allowed in flight for a message.
pub const DEFAULT_SCAN_CONCURRENCY: usize = 4;

/// Outcome of protecting a single message.
#[derive(Debug, Clone)]
pub struct ProtectedMessage {
    /// Serialized message, links rewritten and marker header applied.
    pub raw: String,
    pub marked: bool,
    pub urls: UrlSet,
    pub attachments: usize,
}

/// Rewrites the links of a message and marks it when any link or attachment
/// is reported as malicious.
///
/// The link check runs first and stops at the first malicious verdict,
/// attachments are only inspected when every link came back clean. Lookup
/// failures never block a message, the item is treated as clean.
pub struct MessageProtector {
    rewriter: ContentRewriter,
    url_scanner: Arc<dyn UrlScanner>,
    file_scanner: Arc<dyn FileScanner>,
    marker_header: String,
    scan_concurrency: usize,
}

impl MessageProtector {
    pub fn new(
        rewriter: ContentRewriter,
        url_scanner: Arc<dyn UrlScanner>,
        file_scanner: Arc<dyn FileScanner>,
    ) -> Self {
        Self {
            rewriter,
            url_scanner,
            file_scanner,
            marker_header: DEFAULT_MARKER_HEADER.to_string(),
            scan_concurrency: DEFAULT_SCAN_CONCURRENCY,
        }
    }

    pub fn with_marker_header(mut self, marker_header: impl Into<String>) -> Self {
        self.marker_header = marker_header.into();
        self
    }

    /// Sets the number of concurrent lookups, `1` checks items one by one.
    pub fn with_scan_concurrency(mut self, scan_concurrency: usize) -> Self {
        self.scan_concurrency = scan_concurrency.max(1);
        self
    }

    pub fn marker_header(&self) -> &str {
        &self.marker_header
    }

    pub fn rewriter(&self) -> &ContentRewriter {
        &self.rewriter
    }

    pub async fn protect(&self, raw: &str) -> ProtectResult<ProtectedMessage> {
        let mut parsed = BodyProcessor::parse(&self.rewriter, raw)?;
        parsed.headers = strip_header(&parsed.headers, &self.marker_header);

        let attachments = parsed.attachments().count();
        let marked = if self.links_malicious(&parsed.urls).await {
            true
        } else {
            self.attachments_malicious(&parsed.sections).await
        };

        if marked {
            parsed.headers.push_str(&self.marker_header);
            parsed.headers.push_str(": ");
            parsed.headers.push_str(MARKER_VALUE);
            parsed.headers.push('\n');
        }

        info!(
            urls = parsed.urls.len(),
            attachments = attachments,
            sections = parsed.sections.len(),
            marked = marked,
            "Protected message"
        );

        Ok(ProtectedMessage {
            raw: parsed.serialize(),
            marked,
            urls: parsed.urls,
            attachments,
        })
    }

    async fn links_malicious(&self, urls: &UrlSet) -> bool {
        let checks = urls
            .iter()
            .map(|url| check_url(self.url_scanner.clone(), url.clone()))
            .collect();
        first_malicious(checks, self.scan_concurrency).await
    }

    async fn attachments_malicious(&self, sections: &[Section]) -> bool {
        let checks = sections
            .iter()
            .filter(|section| section.is_attachment)
            .map(|section| {
                inspect_attachment(
                    self.file_scanner.clone(),
                    AttachmentInspector::payload(section),
                )
            })
            .collect();
        first_malicious(checks, self.scan_concurrency).await
    }
}

/// Polls the checks with at most `limit` of them in flight and stops at the
/// first malicious verdict.
async fn first_malicious<F>(checks: Vec<F>, limit: usize) -> bool
where
    F: Future<Output = bool>,
{
    let mut pending = checks.into_iter();
    let mut in_flight = FuturesUnordered::new();
    in_flight.extend(pending.by_ref().take(limit));
    while let Some(malicious) = in_flight.next().await {
        if malicious {
            return true;
        }
        in_flight.extend(pending.next());
    }
    false
}

async fn check_url(scanner: Arc<dyn UrlScanner>, url: String) -> bool {
    match scanner.scan_url(&url).await {
        Ok(reports) if reports.is_empty() => {
            warn!(url = %url, scanner = scanner.name(), "Empty URL reputation result");
            false
        }
        Ok(reports) => {
            let malicious = reports.iter().any(|report| report.is_malicious());
            debug!(url = %url, malicious = malicious, "URL verdict");
            malicious
        }
        Err(error) => {
            warn!(url = %url, error = %error, "Failed to scan URL");
            false
        }
    }
}

async fn inspect_attachment(scanner: Arc<dyn FileScanner>, payload: AttachmentPayload) -> bool {
    AttachmentInspector::new(scanner.as_ref())
        .inspect_payload(&payload)
        .await
}

/// Removes every occurrence of a header, folded continuation lines
/// included, from a header block.
///
/// # Examples
///
/// ```rust
/// use mailshield_protect::strip_header;
///
/// let headers = "From: a@example.com\nX-Action: block\n\tagain\nSubject: hi\n";
/// assert_eq!(
///     strip_header(headers, "x-action"),
///     "From: a@example.com\nSubject: hi\n"
/// );
/// ```
pub fn strip_header(headers: &str, name: &str) -> String {
    let mut output = String::with_capacity(headers.len());
    let mut skipping = false;
    for line in headers.lines() {
        if skipping && line.starts_with([' ', '\t']) {
            continue;
        }
        skipping = header_value(line, name).is_some();
        if skipping {
            debug!(header = %name, "Stripped header from message");
            continue;
        }
        output.push_str(line);
        output.push('\n');
    }
    output
}
