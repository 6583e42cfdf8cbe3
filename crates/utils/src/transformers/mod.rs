//! Built-in email transformations applied before delivery.
//!
//! Each transformer runs in the pipeline between message reception and
//! delivery. Currently supports `Received` trace header injection and the
//! link rewriting and reputation checks of the protection engine.

pub mod protection;
pub mod received;

pub use protection::*;
pub use received::*;
