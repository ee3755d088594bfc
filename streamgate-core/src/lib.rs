pub mod client;
pub mod config;
pub mod error;
pub mod extractor;
pub mod logging;
pub mod routing;

pub use client::ClientPool;
pub use config::Config;
pub use error::{Error, Result};
pub use routing::TransportRoute;
