//! Per-part transfer encoding codecs.
//!
//! A codec is created when the header block of a part ends, receives every
//! body line of that part and is consumed by [`TransferCodec::flush`], which
//! decodes the payload, runs it through the content rewriter and encodes
//! it back the way it arrived.

mod b64;
mod plain;
mod qp;

use std::mem::take;

pub use b64::Base64Codec;
pub use plain::PlainCodec;
pub use qp::QuotedPrintableCodec;

use crate::{ContentRewriter, ContentType, TransferEncoding};

/// Maximum length of an encoded line (RFC 2045).
pub const LINE_LENGTH: usize = 76;

/// Output of a codec flush, the section data and the URLs it rewrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flushed {
    pub data: String,
    pub urls: Vec<String>,
}

/// Codec for the body of a single part, selected by its transfer encoding.
#[derive(Debug)]
pub enum TransferCodec {
    Default(PlainCodec),
    Base64(Base64Codec),
    QuotedPrintable(QuotedPrintableCodec),
}

impl TransferCodec {
    pub fn new(encoding: TransferEncoding, content_type: ContentType) -> Self {
        match encoding {
            TransferEncoding::Default => TransferCodec::Default(PlainCodec::new(content_type)),
            TransferEncoding::Base64 => TransferCodec::Base64(Base64Codec::new(content_type)),
            TransferEncoding::QuotedPrintable => {
                TransferCodec::QuotedPrintable(QuotedPrintableCodec::new(content_type))
            }
        }
    }

    pub fn encoding(&self) -> TransferEncoding {
        match self {
            TransferCodec::Default(_) => TransferEncoding::Default,
            TransferCodec::Base64(_) => TransferEncoding::Base64,
            TransferCodec::QuotedPrintable(_) => TransferEncoding::QuotedPrintable,
        }
    }

    pub fn process(&mut self, line: &str) {
        match self {
            TransferCodec::Default(codec) => codec.process(line),
            TransferCodec::Base64(codec) => codec.process(line),
            TransferCodec::QuotedPrintable(codec) => codec.process(line),
        }
    }

    pub fn flush(self, rewriter: &ContentRewriter) -> Flushed {
        match self {
            TransferCodec::Default(codec) => codec.flush(rewriter),
            TransferCodec::Base64(codec) => codec.flush(rewriter),
            TransferCodec::QuotedPrintable(codec) => codec.flush(rewriter),
        }
    }
}

/// A run of body lines, either open to rewriting or copied verbatim.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Segment<T> {
    Rewrite(T),
    Verbatim(String),
}

/// Ordered segments of a part body, consecutive lines of the same kind are merged.
#[derive(Debug, Default)]
pub(crate) struct Segments<T> {
    items: Vec<Segment<T>>,
    pending: T,
}

impl<T: Default + PartialEq> Segments<T> {
    /// Returns the rewritable run currently being accumulated.
    pub(crate) fn pending(&mut self) -> &mut T {
        &mut self.pending
    }

    pub(crate) fn push_verbatim(&mut self, line: &str) {
        self.close_pending();
        if let Some(Segment::Verbatim(text)) = self.items.last_mut() {
            text.push_str(line);
            text.push('\n');
            return;
        }
        self.items.push(Segment::Verbatim(format!("{line}\n")));
    }

    pub(crate) fn into_items(mut self) -> Vec<Segment<T>> {
        self.close_pending();
        self.items
    }

    fn close_pending(&mut self) {
        if self.pending != T::default() {
            let pending = take(&mut self.pending);
            self.items.push(Segment::Rewrite(pending));
        }
    }
}

/// Returns whether a line only holds characters of the base64 alphabet.
pub(crate) fn is_base64_line(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty()
        && line
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

/// Hard-wraps `text` into lines of at most `width` chars, each ending in `\n`.
pub(crate) fn wrap_lines(text: &str, width: usize) -> String {
    let mut output = String::with_capacity(text.len() + text.len() / width + 1);
    let mut count = 0;
    for c in text.chars() {
        if count == width {
            output.push('\n');
            count = 0;
        }
        output.push(c);
        count += 1;
    }
    if count > 0 {
        output.push('\n');
    }
    output
}
