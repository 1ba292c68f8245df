//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields (connection id, exchange key, state) on every event
//! - Metrics are cheap (atomic increments) and safe without a recorder
//! - Access and trace logging belong to the codec layer, not here

pub mod logging;
pub mod metrics;
