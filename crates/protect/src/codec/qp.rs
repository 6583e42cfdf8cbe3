use quoted_printable::ParseMode;
use tracing::{debug, warn};

use crate::{ContentRewriter, ContentType, ForwardedSectionDetector};

use super::{Flushed, Segment, Segments};

/// Raw lines of a rewritable run together with their decoded content.
#[derive(Debug, Default, PartialEq, Eq)]
struct QuotedRun {
    decoded: Vec<u8>,
    raw: String,
}

/// Codec for quoted-printable parts.
///
/// Each line is decoded as it arrives so that forwarded-message markers can
/// be recognized on the decoded text. Runs where no link had to be replaced
/// are emitted exactly as received, the others are re-encoded.
#[derive(Debug)]
pub struct QuotedPrintableCodec {
    content_type: ContentType,
    detector: ForwardedSectionDetector,
    segments: Segments<QuotedRun>,
}

impl QuotedPrintableCodec {
    pub fn new(content_type: ContentType) -> Self {
        Self {
            content_type,
            detector: ForwardedSectionDetector::new(content_type),
            segments: Segments::default(),
        }
    }

    pub fn process(&mut self, line: &str) {
        let decoded = decode_line(line);
        let visible = String::from_utf8_lossy(&decoded);
        if self.detector.observe(visible.trim_end_matches('\n')) {
            self.segments.push_verbatim(line);
            return;
        }
        let run = self.segments.pending();
        run.decoded.extend_from_slice(&decoded);
        run.raw.push_str(line);
        run.raw.push('\n');
    }

    pub fn is_forwarded(&self) -> bool {
        self.detector.is_forwarded()
    }

    pub fn flush(self, rewriter: &ContentRewriter) -> Flushed {
        let mut flushed = Flushed::default();
        for segment in self.segments.into_items() {
            match segment {
                Segment::Rewrite(run) => {
                    let (bytes, urls) = rewriter.rewrite_bytes(self.content_type, &run.decoded);
                    if urls.is_empty() {
                        flushed.data.push_str(&run.raw);
                        continue;
                    }
                    flushed.data.push_str(&encode(&bytes));
                    if !bytes.ends_with(b"\n") {
                        // the run ended on a soft line break
                        flushed.data.push_str("=\n");
                    }
                    flushed.urls.extend(urls);
                }
                Segment::Verbatim(text) => flushed.data.push_str(&text),
            }
        }
        debug!(
            content_type = self.content_type.name(),
            urls = flushed.urls.len(),
            "Flushed quoted-printable part"
        );
        flushed
    }
}

/// Decodes one encoded line, appending the line break unless the line ends
/// on a soft break (`=`).
///
/// Lines holding raw 8-bit characters are not valid quoted-printable and
/// are taken literally.
fn decode_line(line: &str) -> Vec<u8> {
    let soft_break = line.trim_end().ends_with('=');
    let mut decoded = if line.is_ascii() {
        match quoted_printable::decode(line, ParseMode::Robust) {
            Ok(decoded) => decoded,
            Err(error) => {
                warn!(error = %error, "Failed to decode quoted-printable line, keeping raw content");
                line.as_bytes().to_vec()
            }
        }
    } else {
        line.as_bytes().to_vec()
    };
    if !soft_break {
        decoded.push(b'\n');
    }
    decoded
}

/// Encodes `\n` terminated content, producing `\n` terminated lines.
fn encode(bytes: &[u8]) -> String {
    let mut crlf = Vec::with_capacity(bytes.len() + bytes.len() / 32);
    for &byte in bytes {
        if byte == b'\n' {
            crlf.push(b'\r');
        }
        crlf.push(byte);
    }
    quoted_printable::encode_to_str(crlf).replace("\r\n", "\n")
}
