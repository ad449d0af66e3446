pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod server;
pub mod sessions;
pub mod store;
pub mod types;
pub mod validation;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
