use crate::{ContentType, TransferEncoding};

/// One MIME body part as already processed, ready for re-serialization.
///
/// `headers` holds the raw header block of the part, starting with the
/// boundary delimiter line that opened it, each line terminated by `\n`.
/// `data` is the transformed and re-encoded payload, including the closing
/// delimiter and any epilogue when this is the last part of a multipart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    pub headers: String,
    pub content_type: ContentType,
    pub content_transfer_encoding: TransferEncoding,
    pub charset: Option<String>,
    pub data: String,
    pub is_attachment: bool,
    pub attachment_file_name: Option<String>,
}

impl Section {
    /// Transfer encoding tag of the codec that produced this section.
    pub fn name(&self) -> &'static str {
        self.content_transfer_encoding.name()
    }

    /// Writes the section as it appears in the message, the header block and
    /// its blank separator line followed by the data.
    ///
    /// A section without headers (the body of a single part message) is
    /// just its data.
    pub fn render_into(&self, output: &mut String) {
        if !self.headers.is_empty() {
            output.push_str(&self.headers);
            output.push('\n');
        }
        output.push_str(&self.data);
    }

    pub fn render(&self) -> String {
        let mut output = String::with_capacity(self.headers.len() + 1 + self.data.len());
        self.render_into(&mut output);
        output
    }
}
