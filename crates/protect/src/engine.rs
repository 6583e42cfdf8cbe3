//! Line-driven multipart boundary engine.
//!
//! [`BodyProcessor`] walks a raw message one line at a time. The outer
//! header block is collected first, then each body line is classified
//! against the stack of active boundaries: a delimiter closes the part being
//! read and opens (or ends) the next one, header lines of a part are
//! collected until its blank separator line, and payload lines are handed to
//! the part's [`TransferCodec`]. Every part becomes a [`Section`] in an arena
//! indexed by [`PartId`], in the order the parts appear in the message.

use std::{collections::HashSet, mem};

use tracing::{debug, warn};

use crate::{
    attachment_file_name, header_param, header_value, ContentRewriter, ContentType, Flushed, ProtectError,
    ProtectResult, Section, TransferCodec, TransferEncoding,
};

/// Set of original URLs found in a message, deduplicated by exact match.
pub type UrlSet = HashSet<String>;

/// Index of a part in the [`ParsedMessage::sections`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartId(pub usize);

/// A message split into its outer header block and processed body parts.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    /// Outer header lines, each terminated by `\n`.
    pub headers: String,
    /// Text between the outer headers and the first boundary.
    pub preamble: String,
    pub sections: Vec<Section>,
    pub urls: UrlSet,
}

impl ParsedMessage {
    /// Serializes the message, headers, blank separator line, preamble and
    /// every section in order.
    pub fn serialize(&self) -> String {
        let size = self.headers.len()
            + 1
            + self.preamble.len()
            + self
                .sections
                .iter()
                .map(|section| section.headers.len() + 1 + section.data.len())
                .sum::<usize>();
        let mut output = String::with_capacity(size);
        output.push_str(&self.headers);
        output.push('\n');
        output.push_str(&self.preamble);
        for section in &self.sections {
            section.render_into(&mut output);
        }
        output
    }

    pub fn attachments(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|section| section.is_attachment)
    }
}

#[derive(Debug)]
enum State {
    OuterHeaders,
    AwaitingBoundary,
    InHeaders(PartId),
    InBody(PartId, TransferCodec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delimiter {
    Open,
    Close,
}

/// Declarations seen in the header block being read, first match wins.
#[derive(Debug, Default)]
struct Declarations {
    content_type: Option<ContentType>,
    /// `Content-Type:` seen with its value folded onto the next line.
    folded_type: bool,
    encoding: Option<TransferEncoding>,
    charset: Option<String>,
}

/// Streaming MIME body processor, one instance per message.
pub struct BodyProcessor<'a> {
    rewriter: &'a ContentRewriter,
    state: State,
    boundaries: Vec<String>,
    declared: Declarations,
    message: ParsedMessage,
}

impl<'a> BodyProcessor<'a> {
    pub fn new(rewriter: &'a ContentRewriter) -> Self {
        Self {
            rewriter,
            state: State::OuterHeaders,
            boundaries: Vec::new(),
            declared: Declarations::default(),
            message: ParsedMessage::default(),
        }
    }

    /// Processes a whole raw message (CRLF or LF line endings).
    pub fn parse(rewriter: &'a ContentRewriter, raw: &str) -> ProtectResult<ParsedMessage> {
        let mut processor = Self::new(rewriter);
        for line in raw.lines() {
            processor.process_line(line)?;
        }
        processor.finish()
    }

    /// Returns the innermost open boundary.
    pub fn active_boundary(&self) -> Option<&str> {
        self.boundaries.last().map(String::as_str)
    }

    /// Feeds a single line, without its line terminator.
    pub fn process_line(&mut self, line: &str) -> ProtectResult<()> {
        let state = mem::replace(&mut self.state, State::AwaitingBoundary);
        self.state = match state {
            State::OuterHeaders => self.outer_header(line)?,
            state => match self.resolve_delimiter(line) {
                Some(delimiter) => self.delimiter(state, delimiter, line),
                None => self.content(state, line),
            },
        };
        Ok(())
    }

    /// Flushes whatever part is still open and returns the parsed message.
    pub fn finish(mut self) -> ProtectResult<ParsedMessage> {
        let state = mem::replace(&mut self.state, State::AwaitingBoundary);
        self.close_part(state);
        if !self.boundaries.is_empty() {
            debug!(
                open = self.boundaries.len(),
                "Input ended before every boundary was closed"
            );
        }
        Ok(self.message)
    }

    fn outer_header(&mut self, line: &str) -> ProtectResult<State> {
        if !line.is_empty() {
            self.message.headers.push_str(line);
            self.message.headers.push('\n');
            self.declare(line);
            return Ok(State::OuterHeaders);
        }

        if !self.boundaries.is_empty() {
            return Ok(State::AwaitingBoundary);
        }
        if self.declared.content_type == Some(ContentType::Multipart) {
            return Err(ProtectError::MissingBoundary);
        }

        // single part message, the outer headers describe the body
        self.message.sections.push(Section::default());
        let id = PartId(self.message.sections.len() - 1);
        Ok(self.begin_body(id))
    }

    fn content(&mut self, state: State, line: &str) -> State {
        match state {
            State::InHeaders(id) if line.is_empty() => self.begin_body(id),
            State::InHeaders(id) => {
                let section = &mut self.message.sections[id.0];
                section.headers.push_str(line);
                section.headers.push('\n');
                self.declare(line);
                State::InHeaders(id)
            }
            State::InBody(id, mut codec) => {
                codec.process(line);
                State::InBody(id, codec)
            }
            State::AwaitingBoundary | State::OuterHeaders => {
                self.append_outside(line);
                State::AwaitingBoundary
            }
        }
    }

    fn delimiter(&mut self, state: State, delimiter: Delimiter, line: &str) -> State {
        self.close_part(state);
        match delimiter {
            Delimiter::Open => {
                self.declared = Declarations::default();
                self.message.sections.push(Section {
                    headers: format!("{line}\n"),
                    ..Default::default()
                });
                State::InHeaders(PartId(self.message.sections.len() - 1))
            }
            Delimiter::Close => {
                self.append_outside(line);
                if self.boundaries.pop().is_none() {
                    warn!(line = %line, "Closing delimiter without an open boundary");
                }
                State::AwaitingBoundary
            }
        }
    }

    /// Matches a line against the open boundaries, innermost first.
    ///
    /// A delimiter of an outer boundary implicitly closes the inner ones
    /// that were never terminated.
    fn resolve_delimiter(&mut self, line: &str) -> Option<Delimiter> {
        let marker = line.strip_prefix("--")?;
        let (depth, delimiter) = self
            .boundaries
            .iter()
            .enumerate()
            .rev()
            .find_map(|(depth, boundary)| {
                if marker == boundary {
                    Some((depth, Delimiter::Open))
                } else if marker.strip_suffix("--") == Some(boundary.as_str()) {
                    Some((depth, Delimiter::Close))
                } else {
                    None
                }
            })?;

        if depth + 1 < self.boundaries.len() {
            warn!(
                unterminated = self.boundaries.len() - depth - 1,
                "Nested boundary closed by an outer delimiter"
            );
            self.boundaries.truncate(depth + 1);
        }
        Some(delimiter)
    }

    fn begin_body(&mut self, id: PartId) -> State {
        let declared = mem::take(&mut self.declared);
        let content_type = declared.content_type.unwrap_or_default();
        let encoding = declared.encoding.unwrap_or_default();

        let file_name = {
            let headers = &self.message.sections[id.0].headers;
            attachment_file_name(if headers.is_empty() {
                &self.message.headers
            } else {
                headers
            })
        };

        let section = &mut self.message.sections[id.0];
        section.content_type = content_type;
        section.content_transfer_encoding = encoding;
        section.charset = declared.charset;
        section.is_attachment = file_name.is_some();
        section.attachment_file_name = file_name;

        State::InBody(id, TransferCodec::new(encoding, content_type))
    }

    fn close_part(&mut self, state: State) {
        let (id, flushed) = match state {
            State::InHeaders(id) => (id, Flushed::default()),
            State::InBody(id, codec) => (id, codec.flush(self.rewriter)),
            State::AwaitingBoundary | State::OuterHeaders => return,
        };
        let section = &mut self.message.sections[id.0];
        debug!(
            part = id.0,
            content_type = section.content_type.name(),
            encoding = section.name(),
            attachment = section.is_attachment,
            "Flushed section"
        );
        section.data = flushed.data;
        self.message.urls.extend(flushed.urls);
    }

    /// Keeps lines that belong to no part, the preamble before the first
    /// part or the closing delimiter and epilogue after the last one.
    fn append_outside(&mut self, line: &str) {
        let target = match self.message.sections.last_mut() {
            Some(section) => &mut section.data,
            None => &mut self.message.preamble,
        };
        target.push_str(line);
        target.push('\n');
    }

    fn declare(&mut self, line: &str) {
        if self.declared.content_type.is_none() {
            self.declared.content_type =
                if self.declared.folded_type && line.starts_with([' ', '\t']) {
                    ContentType::from_header_line(&format!("Content-Type: {}", line.trim()))
                } else {
                    ContentType::from_header_line(line)
                };
            self.declared.folded_type =
                header_value(line, "Content-Type").is_some_and(str::is_empty);
        }
        if self.declared.encoding.is_none() {
            self.declared.encoding = TransferEncoding::from_header_line(line);
        }
        if self.declared.charset.is_none() {
            self.declared.charset = header_param(line, "charset");
        }
        if self.declared.content_type == Some(ContentType::Multipart) {
            if let Some(boundary) = header_param(line, "boundary") {
                if self.active_boundary() != Some(boundary.as_str()) {
                    debug!(boundary = %boundary, depth = self.boundaries.len(), "Opened boundary");
                    self.boundaries.push(boundary);
                }
            }
        }
    }
}
