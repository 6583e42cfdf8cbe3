use base64::{engine::general_purpose, Engine as _};
use tracing::{debug, warn};

use crate::{ContentRewriter, ContentType};

use super::{is_base64_line, wrap_lines, Flushed, LINE_LENGTH};

/// Codec for base64 encoded parts.
///
/// Lines that precede the payload and are not base64 (part-local
/// sub-headers) are kept verbatim up to the first empty line. The payload is
/// decoded as a whole on flush, rewritten when it is text and re-encoded
/// with lines of [`LINE_LENGTH`] chars.
#[derive(Debug)]
pub struct Base64Codec {
    content_type: ContentType,
    sub_headers: String,
    payload: String,
    past_sub_headers: bool,
    trailing_blank_lines: usize,
}

impl Base64Codec {
    pub fn new(content_type: ContentType) -> Self {
        Self {
            content_type,
            sub_headers: String::new(),
            payload: String::new(),
            past_sub_headers: false,
            trailing_blank_lines: 0,
        }
    }

    pub fn process(&mut self, line: &str) {
        if !self.past_sub_headers {
            if line.is_empty() {
                self.sub_headers.push('\n');
                self.past_sub_headers = true;
                return;
            }
            if !is_base64_line(line) {
                self.sub_headers.push_str(line);
                self.sub_headers.push('\n');
                return;
            }
            self.past_sub_headers = true;
        }

        let line = line.trim();
        if line.is_empty() {
            self.trailing_blank_lines += 1;
            return;
        }
        self.trailing_blank_lines = 0;
        self.payload.push_str(line);
    }

    pub fn flush(self, rewriter: &ContentRewriter) -> Flushed {
        let mut flushed = Flushed {
            data: self.sub_headers,
            urls: Vec::new(),
        };

        if !self.payload.is_empty() {
            match general_purpose::STANDARD.decode(&self.payload) {
                Ok(bytes) => {
                    let (bytes, urls) = rewriter.rewrite_bytes(self.content_type, &bytes);
                    let encoded = general_purpose::STANDARD.encode(bytes);
                    flushed.data.push_str(&wrap_lines(&encoded, LINE_LENGTH));
                    flushed.urls = urls;
                }
                Err(error) => {
                    warn!(
                        content_type = self.content_type.name(),
                        error = %error,
                        "Failed to decode base64 payload, keeping raw content"
                    );
                    flushed.data.push_str(&wrap_lines(&self.payload, LINE_LENGTH));
                }
            }
        }

        for _ in 0..self.trailing_blank_lines {
            flushed.data.push('\n');
        }
        debug!(
            content_type = self.content_type.name(),
            urls = flushed.urls.len(),
            "Flushed base64 part"
        );
        flushed
    }
}
