//! # Structured Logging
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` seeded from
//! `RUST_LOG` (falling back to the configured level) and a JSON or text
//! `fmt` layer.

use crate::observability::config::{LogConfig, LogFormat};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Filter from `RUST_LOG`, else the configured level, else `info`
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed, which happens
/// when tests or an embedding application initialise logging first.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = env_filter(&config.level);

    let installed = match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
            .is_ok(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
            .is_ok(),
    };

    if installed {
        info!(level = %config.level, format = %config.format, "Structured logging initialized");
    } else {
        warn!("Tracing subscriber already initialized, skipping initialization");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_tolerated() {
        let config = LogConfig {
            level: "debug".to_string(),
            format: LogFormat::Text,
        };
        init_logging(&config);
        assert!(!init_logging(&config));
    }

    #[test]
    fn test_invalid_level_falls_back() {
        // must not panic
        let _ = env_filter("not a [valid directive");
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
