//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Configure log level from the environment or configuration
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - `RUST_LOG` wins over the configured level

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Falls back to `http_transport=<level>`.
pub fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("http_transport={},transportd={}", level, level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
