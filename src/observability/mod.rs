//! Logging setup shared by the cache and rate limit layers.

pub mod config;
pub mod logging;

pub use config::{LogConfig, LogFormat};
pub use logging::init_logging;
