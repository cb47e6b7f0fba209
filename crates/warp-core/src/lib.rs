//! Shared WarpGrid types and server configuration.

pub mod config;
pub mod types;

pub use config::ServerConfig;
pub use types::*;
