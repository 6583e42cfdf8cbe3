//! MIME body rewriting and threat inspection.
//!
//! The crate walks a raw RFC 2045/2046 message line by line, decodes
//! each body part according to its transfer encoding, defangs the links
//! it finds and re-encodes the result so that the serialized message
//! mirrors the input byte for byte wherever nothing had to change.
//! The [`MessageProtector`] composes the engine with the URL and file
//! reputation collaborators and decides whether the message gets marked.

pub mod attachment;
pub mod codec;
pub mod content_type;
pub mod engine;
pub mod error;
pub mod forwarded;
pub mod html;
pub mod protector;
pub mod rewrite;
pub mod scanner;
pub mod section;
pub mod url;

pub use attachment::*;
pub use codec::*;
pub use content_type::*;
pub use engine::*;
pub use error::*;
pub use forwarded::*;
pub use html::*;
pub use protector::*;
pub use rewrite::*;
pub use scanner::*;
pub use section::*;
pub use url::*;
