use crate::{ContentRewriter, ContentType, ForwardedSectionDetector};

use super::{Flushed, Segment, Segments};

/// Codec for parts without a transfer encoding, lines are kept as they are
/// and only links are rewritten.
#[derive(Debug)]
pub struct PlainCodec {
    content_type: ContentType,
    detector: ForwardedSectionDetector,
    segments: Segments<String>,
}

impl PlainCodec {
    pub fn new(content_type: ContentType) -> Self {
        Self {
            content_type,
            detector: ForwardedSectionDetector::new(content_type),
            segments: Segments::default(),
        }
    }

    pub fn process(&mut self, line: &str) {
        if self.detector.observe(line) {
            self.segments.push_verbatim(line);
        } else {
            let pending = self.segments.pending();
            pending.push_str(line);
            pending.push('\n');
        }
    }

    pub fn is_forwarded(&self) -> bool {
        self.detector.is_forwarded()
    }

    pub fn flush(self, rewriter: &ContentRewriter) -> Flushed {
        let mut flushed = Flushed::default();
        for segment in self.segments.into_items() {
            match segment {
                Segment::Rewrite(text) => {
                    let rewritten = rewriter.rewrite(self.content_type, &text);
                    flushed.data.push_str(&rewritten.text);
                    flushed.urls.extend(rewritten.urls);
                }
                Segment::Verbatim(text) => flushed.data.push_str(&text),
            }
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{UrlEncoder, UrlRewriter, DEFAULT_ENCRYPTION_KEY};

    fn rewriter() -> ContentRewriter {
        let encoder = UrlEncoder::new(DEFAULT_ENCRYPTION_KEY.as_bytes()).unwrap();
        ContentRewriter::new(UrlRewriter::new("https://protect.local/r", encoder))
    }

    #[test]
    fn test_plain_rewrites_links() {
        let mut codec = PlainCodec::new(ContentType::TextPlain);
        codec.process("Hello,");
        codec.process("please check https://example.com/invoice");
        codec.process("");

        let flushed = codec.flush(&rewriter());
        assert_eq!(flushed.urls, vec!["https://example.com/invoice".to_string()]);
        assert!(flushed.data.starts_with("Hello,\nplease check https://protect.local/r?u="));
        assert!(flushed.data.ends_with("\n\n"));
    }

    #[test]
    fn test_plain_without_links_is_identity() {
        let mut codec = PlainCodec::new(ContentType::Default);
        codec.process("line one");
        codec.process("line two");

        let flushed = codec.flush(&rewriter());
        assert_eq!(flushed.data, "line one\nline two\n");
        assert!(flushed.urls.is_empty());
    }

    #[test]
    fn test_plain_forwarded_block_is_verbatim() {
        let mut codec = PlainCodec::new(ContentType::TextPlain);
        codec.process("see https://one.example.com");
        codec.process("---------- Forwarded message ---------");
        codec.process("From: https://two.example.com");
        assert!(codec.is_forwarded());
        codec.process("");
        assert!(!codec.is_forwarded());
        codec.process("and https://three.example.com");

        let flushed = codec.flush(&rewriter());
        assert_eq!(
            flushed.urls,
            vec![
                "https://one.example.com".to_string(),
                "https://three.example.com".to_string()
            ]
        );
        assert!(flushed
            .data
            .contains("---------- Forwarded message ---------\nFrom: https://two.example.com\n\n"));
    }

    #[test]
    fn test_binary_part_untouched() {
        let mut codec = PlainCodec::new(ContentType::Application);
        codec.process("https://example.com");

        let flushed = codec.flush(&rewriter());
        assert_eq!(flushed.data, "https://example.com\n");
        assert!(flushed.urls.is_empty());
    }
}
