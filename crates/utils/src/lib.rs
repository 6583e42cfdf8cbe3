pub mod auth;
pub mod config;
pub mod handler;
pub mod handlers;
pub mod message;
pub mod metrics;
pub mod mime;
pub mod net;
pub mod router;
pub mod tls;
pub mod transformer;
pub mod transformers;

pub use auth::*;
pub use config::*;
pub use handler::*;
pub use handlers::*;
pub use message::*;
pub use metrics::*;
pub use mime::*;
pub use net::*;
pub use router::*;
pub use tls::*;
pub use transformer::*;
pub use transformers::*;
