use crate::{ContentType, HtmlUrlRewriter, Rewritten, UrlRewriter};

/// Dispatches decoded part payloads to the rewriter matching their content type.
///
/// Plain text (and unencoded parts without a known content type) go through
/// the [`UrlRewriter`], HTML through the [`HtmlUrlRewriter`], everything else
/// is passed through as is.
#[derive(Debug, Clone)]
pub struct ContentRewriter {
    urls: UrlRewriter,
    html: HtmlUrlRewriter,
}

impl ContentRewriter {
    pub fn new(urls: UrlRewriter) -> Self {
        let html = HtmlUrlRewriter::new(urls.clone());
        Self { urls, html }
    }

    pub fn urls(&self) -> &UrlRewriter {
        &self.urls
    }

    pub fn rewrite(&self, content_type: ContentType, text: &str) -> Rewritten {
        match content_type {
            ContentType::TextPlain | ContentType::Default => self.urls.replace(text),
            ContentType::TextHtml => {
                let mut rewritten = self.html.replace(text);
                // rewritten HTML always ends on a line break
                if !rewritten.urls.is_empty() && !rewritten.text.ends_with('\n') {
                    rewritten.text.push('\n');
                }
                rewritten
            }
            _ => Rewritten::unchanged(text),
        }
    }

    /// Rewrites a decoded payload given as raw bytes, only declared text
    /// types are touched.
    ///
    /// Payloads that are not valid UTF-8 are viewed one byte per char, which
    /// keeps every original byte intact while still exposing ASCII links.
    pub fn rewrite_bytes(&self, content_type: ContentType, bytes: &[u8]) -> (Vec<u8>, Vec<String>) {
        if !content_type.is_text() {
            return (bytes.to_vec(), Vec::new());
        }
        match std::str::from_utf8(bytes) {
            Ok(text) => {
                let rewritten = self.rewrite(content_type, text);
                (rewritten.text.into_bytes(), rewritten.urls)
            }
            Err(_) => {
                let text: String = bytes.iter().map(|&byte| byte as char).collect();
                let rewritten = self.rewrite(content_type, &text);
                let bytes = rewritten.text.chars().map(|c| c as u32 as u8).collect();
                (bytes, rewritten.urls)
            }
        }
    }
}
