//! Classification of body parts from their raw header lines.
//!
//! Matching is deliberately shallow: each header line is inspected on its
//! own and only the handful of declarations the engine cares about are
//! recognized (`Content-Type`, `Content-Transfer-Encoding`, the `boundary`
//! and `charset` parameters and the attachment file name).

use std::sync::LazyLock;

use regex::Regex;

static FILE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)filename\*?\s*=\s*"?([^";\r\n]+)"?"#).expect("valid file name regex")
});

/// Content type of a body part, reduced to the closed set the rewriters handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentType {
    /// No (or an unrecognized) `Content-Type` header.
    #[default]
    Default,
    TextPlain,
    TextHtml,
    Image,
    Multipart,
    Pdf,
    Rar,
    Word,
    PowerPoint,
    Excel,
    SevenZip,
    /// Any other `application/*` payload.
    Application,
}

impl ContentType {
    /// Classifies a `Content-Type:` header line, returns `None` for any other header.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mailshield_protect::ContentType;
    ///
    /// assert_eq!(
    ///     ContentType::from_header_line("Content-Type: text/html; charset=utf-8"),
    ///     Some(ContentType::TextHtml)
    /// );
    /// assert_eq!(
    ///     ContentType::from_header_line("Content-Type: application/octet-stream; name=\"a.xlsx\""),
    ///     Some(ContentType::Excel)
    /// );
    /// assert_eq!(ContentType::from_header_line("Subject: text/html"), None);
    /// assert_eq!(ContentType::from_header_line("Content-Type:"), None);
    /// ```
    ///
    /// An empty value is a folded header, the type is on the next line.
    pub fn from_header_line(line: &str) -> Option<Self> {
        let value = header_value(line, "Content-Type")?.to_ascii_lowercase();
        if value.is_empty() {
            return None;
        }
        let content_type = if value.starts_with("text/plain") {
            ContentType::TextPlain
        } else if value.starts_with("text/html") {
            ContentType::TextHtml
        } else if value.starts_with("image") {
            ContentType::Image
        } else if value.starts_with("multipart") {
            ContentType::Multipart
        } else if value.starts_with("application/pdf") || value.contains(".pdf") {
            ContentType::Pdf
        } else if value.starts_with("application/rar")
            || value.starts_with("application/x-rar")
            || value.contains(".rar")
        {
            ContentType::Rar
        } else if value.contains(".doc") {
            ContentType::Word
        } else if value.contains(".pptx") {
            ContentType::PowerPoint
        } else if value.contains(".xlsx") {
            ContentType::Excel
        } else if value.contains(".7z") {
            ContentType::SevenZip
        } else if value.starts_with("application") {
            ContentType::Application
        } else {
            ContentType::Default
        };
        Some(content_type)
    }

    /// Returns whether the part is declared as text, only those payloads
    /// are decoded and rewritten when transfer encoded.
    pub fn is_text(&self) -> bool {
        matches!(self, ContentType::TextPlain | ContentType::TextHtml)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContentType::Default => "default",
            ContentType::TextPlain => "text/plain",
            ContentType::TextHtml => "text/html",
            ContentType::Image => "image",
            ContentType::Multipart => "multipart",
            ContentType::Pdf => "application/pdf",
            ContentType::Rar => "application/rar",
            ContentType::Word => "doc",
            ContentType::PowerPoint => "pptx",
            ContentType::Excel => "xlsx",
            ContentType::SevenZip => "7z",
            ContentType::Application => "application",
        }
    }
}

/// Wire-level encoding of a part payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransferEncoding {
    /// `7bit`, `8bit`, `binary` or no header at all.
    #[default]
    Default,
    Base64,
    QuotedPrintable,
}

impl TransferEncoding {
    /// Classifies a `Content-Transfer-Encoding:` header line, returns `None`
    /// for any other header.
    pub fn from_header_line(line: &str) -> Option<Self> {
        let value = header_value(line, "Content-Transfer-Encoding")?.to_ascii_lowercase();
        let encoding = match value.trim_end_matches(';') {
            "base64" => TransferEncoding::Base64,
            "quoted-printable" => TransferEncoding::QuotedPrintable,
            _ => TransferEncoding::Default,
        };
        Some(encoding)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransferEncoding::Default => "default",
            TransferEncoding::Base64 => "base64",
            TransferEncoding::QuotedPrintable => "quoted-printable",
        }
    }
}

/// Returns the trimmed value of a header line when its name matches `name`
/// (case-insensitive).
pub fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let prefix = line.get(..name.len())?;
    if !prefix.eq_ignore_ascii_case(name) {
        return None;
    }
    line[name.len()..].strip_prefix(':').map(str::trim)
}

/// Extracts a `param=value` pair from a header line, stripping quotes and
/// any trailing `;`.
///
/// The parameter name is matched case-insensitively while the value keeps
/// its case, boundaries being case-sensitive.
///
/// # Examples
///
/// ```rust
/// use mailshield_protect::header_param;
///
/// assert_eq!(
///     header_param("Content-Type: multipart/mixed; boundary=\"XyZ\"", "boundary"),
///     Some("XyZ".to_string())
/// );
/// assert_eq!(
///     header_param("\tcharset=UTF-8;", "charset"),
///     Some("UTF-8".to_string())
/// );
/// assert_eq!(header_param("Content-Type: text/plain", "charset"), None);
/// ```
pub fn header_param(line: &str, param: &str) -> Option<String> {
    let lowered = line.to_ascii_lowercase();
    let needle = format!("{}=", param.to_ascii_lowercase());
    let mut offset = 0;
    let start = loop {
        let found = offset + lowered[offset..].find(&needle)?;
        let preceded = lowered[..found]
            .chars()
            .next_back()
            .is_none_or(|c| c == ';' || c.is_whitespace());
        if preceded {
            break found + needle.len();
        }
        offset = found + needle.len();
    };

    let rest = &line[start..];
    let value = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next().unwrap_or_default(),
        None => rest
            .split(|c: char| c == ';' || c.is_whitespace())
            .next()
            .unwrap_or_default(),
    };
    let value = value.trim().trim_end_matches(';');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Returns the attachment file name declared by a `Content-Disposition`
/// header inside the given header block, if any.
pub fn attachment_file_name(headers: &str) -> Option<String> {
    if !headers
        .to_ascii_lowercase()
        .contains("content-disposition")
    {
        return None;
    }
    FILE_NAME_REGEX
        .captures(headers)
        .and_then(|captures| captures.get(1))
        .map(|name| name.as_str().trim().to_string())
        .filter(|name| !name.is_empty())
}
