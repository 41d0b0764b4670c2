//! Shared building blocks: errors, configuration, time, request helpers.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod request;

pub use backoff::{ConnectGate, DEFAULT_RECONNECT_BACKOFF};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::EdgeConfig;
pub use error::{EdgeError, EdgeResult};
