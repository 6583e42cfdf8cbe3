use lol_html::{element, rewrite_str, RewriteStrSettings};
use tracing::warn;

use crate::{Rewritten, UrlRewriter};

/// Rewrites the `href` attributes of an HTML fragment through a [`UrlRewriter`].
///
/// Only attribute values change; text content, comments and markup are
/// streamed through untouched, so a fragment never gains wrapper tags.
/// `mailto:` links are left as they are.
#[derive(Debug, Clone)]
pub struct HtmlUrlRewriter {
    urls: UrlRewriter,
}

impl HtmlUrlRewriter {
    pub fn new(urls: UrlRewriter) -> Self {
        Self { urls }
    }

    pub fn replace(&self, html: &str) -> Rewritten {
        let mut found = Vec::new();

        let result = rewrite_str(
            html,
            RewriteStrSettings {
                element_content_handlers: vec![element!("[href]", |el| {
                    let Some(href) = el.get_attribute("href") else {
                        return Ok(());
                    };
                    if is_mailto(&href) {
                        return Ok(());
                    }
                    let rewritten = self.urls.replace(&href.replace("&amp;", "&"));
                    if !rewritten.urls.is_empty() {
                        el.set_attribute("href", &rewritten.text)?;
                        found.extend(rewritten.urls);
                    }
                    Ok(())
                })],
                ..RewriteStrSettings::default()
            },
        );

        match result {
            Ok(text) if !found.is_empty() => Rewritten { text, urls: found },
            Ok(_) => Rewritten::unchanged(html),
            Err(error) => {
                warn!(error = %error, "Failed to rewrite HTML links, keeping part as is");
                Rewritten::unchanged(html)
            }
        }
    }
}

fn is_mailto(href: &str) -> bool {
    href.trim_start()
        .get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("mailto:"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{UrlEncoder, DEFAULT_ENCRYPTION_KEY};

    fn rewriter() -> HtmlUrlRewriter {
        let encoder = UrlEncoder::new(DEFAULT_ENCRYPTION_KEY.as_bytes()).unwrap();
        HtmlUrlRewriter::new(UrlRewriter::new("https://protect.local/r", encoder))
    }

    #[test]
    fn test_rewrites_href_only() {
        let html = r#"<p>Visit <a href="https://example.com/x">https://example.com/x</a></p>"#;
        let result = rewriter().replace(html);

        assert_eq!(result.urls, vec!["https://example.com/x".to_string()]);
        assert!(result.text.contains(r#"<a href="https://protect.local/r?u="#));
        assert!(result.text.contains(">https://example.com/x</a></p>"));
    }

    #[test]
    fn test_skips_mailto() {
        let html = r#"<a href="mailto:someone@example.com">mail</a>"#;
        let result = rewriter().replace(html);

        assert!(result.urls.is_empty());
        assert_eq!(result.text, html);
    }

    #[test]
    fn test_keeps_fragment_shape() {
        let html = "<div><a href=\"http://evil.example/path\">x</a></div>\n";
        let result = rewriter().replace(html);

        assert!(!result.text.contains("<html>"));
        assert!(!result.text.contains("<body>"));
        assert!(result.text.starts_with("<div><a href="));
        assert!(result.text.ends_with("</a></div>\n"));
    }

    #[test]
    fn test_ignores_relative_links() {
        let html = r##"<a href="#top">top</a><a href="/local">local</a>"##;
        let result = rewriter().replace(html);

        assert!(result.urls.is_empty());
        assert_eq!(result.text, html);
    }

    #[test]
    fn test_multiple_links() {
        let html = r#"<a href="https://one.example.com">1</a> <a href="https://two.example.com/b">2</a> <a href="mailto:a@b.com">3</a>"#;
        let result = rewriter().replace(html);

        assert_eq!(result.urls.len(), 2);
        assert!(result.text.contains(r#"<a href="mailto:a@b.com">3</a>"#));
    }
}
