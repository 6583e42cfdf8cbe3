/// Parses headers from a raw email, returning an ordered list of headers
/// and a reference to the content after the blank-line separator.
///
/// Headers are preserved in their original order with case-preserved keys
/// and trimmed values. Folded continuation lines stay attached to their
/// header, line break included, so that the header can be written back
/// unchanged.
///
/// # Examples
///
/// ```rust
/// let (headers, content) = mailshield_utils::parse_raw_headers(
///     "From: alice@example.com\r\nContent-Type: multipart/mixed;\r\n\tboundary=\"X\"\r\n\r\nHello!"
/// );
/// assert_eq!(headers.len(), 2);
/// assert_eq!(headers[0], ("From".to_string(), "alice@example.com".to_string()));
/// assert_eq!(headers[1].1, "multipart/mixed;\r\n\tboundary=\"X\"");
/// assert_eq!(content, "Hello!");
/// ```
pub fn parse_raw_headers(raw: &str) -> (Vec<(String, String)>, &str) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut pos = 0;

    for line in raw.lines() {
        let end = pos + line.len();
        let consumed = if raw[end..].starts_with("\r\n") {
            end + 2
        } else if raw[end..].starts_with('\n') {
            end + 1
        } else {
            end
        };

        if line.trim().is_empty() {
            pos = consumed;
            break;
        }

        if line.starts_with([' ', '\t']) {
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push_str("\r\n");
                    value.push_str(line.trim_end());
                }
                None => break,
            }
        } else if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        } else {
            // Line is not a header (no colon) and not blank, treat as start of content
            break;
        }

        pos = consumed;
    }

    (headers, &raw[pos..])
}

/// Converts every line ending of `raw` to CRLF, as required on the wire.
///
/// # Examples
///
/// ```rust
/// assert_eq!(
///     mailshield_utils::normalize_crlf("a\nb\r\nc\n"),
///     "a\r\nb\r\nc\r\n"
/// );
/// ```
pub fn normalize_crlf(raw: &str) -> String {
    let mut output = String::with_capacity(raw.len() + raw.len() / 32);
    for line in raw.split_inclusive('\n') {
        match line.strip_suffix('\n') {
            Some(line) => {
                output.push_str(line.strip_suffix('\r').unwrap_or(line));
                output.push_str("\r\n");
            }
            None => output.push_str(line),
        }
    }
    output
}

/// How the bytes of the SMTP data were mapped onto the message text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataEncoding {
    /// The data was valid UTF-8 and is carried as is.
    #[default]
    Utf8,
    /// Each byte was mapped to the char of the same value, so 8-bit data
    /// in any charset survives the pipeline unchanged.
    Latin1,
}

/// Turns the bytes received after `DATA` into message text.
///
/// # Examples
///
/// ```rust
/// use mailshield_utils::{decode_data, encode_data, DataEncoding};
///
/// let (text, encoding) = decode_data(b"caf\xe9".to_vec());
/// assert_eq!(text, "caf\u{e9}");
/// assert_eq!(encoding, DataEncoding::Latin1);
/// assert_eq!(encode_data(&text, encoding), b"caf\xe9");
/// ```
pub fn decode_data(data: Vec<u8>) -> (String, DataEncoding) {
    match String::from_utf8(data) {
        Ok(text) => (text, DataEncoding::Utf8),
        Err(e) => (
            e.into_bytes().into_iter().map(char::from).collect(),
            DataEncoding::Latin1,
        ),
    }
}

/// Turns message text back into the bytes sent on the wire, the inverse
/// of [`decode_data`].
///
/// Chars above `U+00FF` cannot come from Latin-1 data, they only appear in
/// text added by the relay and are written as `?`.
pub fn encode_data(text: &str, encoding: DataEncoding) -> Vec<u8> {
    match encoding {
        DataEncoding::Utf8 => text.as_bytes().to_vec(),
        DataEncoding::Latin1 => text
            .chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect(),
    }
}
