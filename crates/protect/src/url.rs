//! Link discovery and defanging for plain text.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose, Engine as _};
use linkify::{LinkFinder, LinkKind};
use tracing::warn;

use crate::{ProtectError, ProtectResult};

/// Key used to seal URL tokens when none is configured.
pub const DEFAULT_ENCRYPTION_KEY: &str = "passphrasewhichneedstobe32bytes!";

const NONCE_SIZE: usize = 12;

/// Text produced by a rewriter together with the original URLs it replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rewritten {
    pub text: String,
    pub urls: Vec<String>,
}

impl Rewritten {
    /// Wraps text that did not need any rewriting.
    pub fn unchanged(text: &str) -> Self {
        Self {
            text: text.to_string(),
            urls: Vec::new(),
        }
    }
}

/// Seals URLs into opaque tokens for the redirect service.
///
/// Tokens are AES-256-GCM ciphertexts under a random nonce, serialized as
/// `base64(hex(nonce || ciphertext))`.
#[derive(Clone)]
pub struct UrlEncoder {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for UrlEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlEncoder").finish_non_exhaustive()
    }
}

impl UrlEncoder {
    /// Creates an encoder from a 32 byte key.
    pub fn new(key: &[u8]) -> ProtectResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| {
            ProtectError::Encryption(format!("key must be 32 bytes, got {}", key.len()))
        })?;
        Ok(Self { cipher })
    }

    pub fn encode(&self, url: &str) -> ProtectResult<String> {
        let nonce: [u8; NONCE_SIZE] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), url.as_bytes())
            .map_err(|_| ProtectError::Encryption("failed to seal URL".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(hex::encode(sealed)))
    }

    /// Opens a token produced by [`encode`](Self::encode).
    pub fn decode(&self, token: &str) -> ProtectResult<String> {
        let hex_text = general_purpose::STANDARD
            .decode(token)
            .map_err(|e| ProtectError::Encryption(format!("invalid token encoding: {e}")))?;
        let sealed = hex::decode(hex_text)
            .map_err(|e| ProtectError::Encryption(format!("invalid token hex: {e}")))?;
        if sealed.len() < NONCE_SIZE {
            return Err(ProtectError::Encryption("token too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ProtectError::Encryption("failed to open URL token".to_string()))?;
        String::from_utf8(plain).map_err(|e| ProtectError::Encryption(e.to_string()))
    }
}

/// Finds URLs in free text and swaps each one for a redirect through the
/// protection service (`<base>?u=<token>`).
///
/// Scheme-less links such as `example.com/path` are matched too, while
/// email addresses are left alone even though their domain looks like a URL.
#[derive(Debug, Clone)]
pub struct UrlRewriter {
    base_url: String,
    encoder: UrlEncoder,
}

impl UrlRewriter {
    pub fn new(base_url: impl Into<String>, encoder: UrlEncoder) -> Self {
        Self {
            base_url: base_url.into(),
            encoder,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn encoder(&self) -> &UrlEncoder {
        &self.encoder
    }

    /// Builds the redirect URL that replaces `url` in rewritten content.
    pub fn redirect(&self, url: &str) -> ProtectResult<String> {
        Ok(format!("{}?u={}", self.base_url, self.encoder.encode(url)?))
    }

    /// Rewrites every URL found in `text`, returning the new text and the
    /// URLs in order of appearance (duplicates included).
    pub fn replace(&self, text: &str) -> Rewritten {
        let mut finder = LinkFinder::new();
        finder.url_must_have_scheme(false).kinds(&[LinkKind::Url]);

        let mut output = String::with_capacity(text.len());
        let mut urls = Vec::new();
        let mut last = 0;

        for link in finder.links(text) {
            let url = link.as_str();
            if is_email_fragment(text, link.start(), url) {
                continue;
            }
            let redirect = match self.redirect(url) {
                Ok(redirect) => redirect,
                Err(error) => {
                    warn!(url = %url, error = %error, "Failed to defang URL, keeping it");
                    continue;
                }
            };
            output.push_str(&text[last..link.start()]);
            output.push_str(&redirect);
            last = link.end();
            urls.push(url.to_string());
        }

        if urls.is_empty() {
            return Rewritten::unchanged(text);
        }
        output.push_str(&text[last..]);
        Rewritten { text: output, urls }
    }
}

fn is_email_fragment(text: &str, start: usize, url: &str) -> bool {
    if url
        .get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("mailto:"))
    {
        return true;
    }
    text[..start].ends_with('@') || (!url.contains("://") && url.contains('@'))
}
