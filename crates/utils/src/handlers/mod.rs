//! Concrete [`MessageHandler`](crate::MessageHandler) implementations.
//!
//! Contains [`RelayHandler`] for delivery to an upstream SMTP server and
//! [`DiscardHandler`] that drops messages, useful for tests and sinks.

pub mod discard;
pub mod relay;

pub use discard::*;
pub use relay::*;
