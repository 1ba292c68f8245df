//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     ConnectorFactory::new → ResourceGroups::new (fixed thread counts)
//!     First pipelining listener → pipelining group created once
//!
//! Shutdown (groups.rs):
//!     close all channels → worker → acceptor → http3 → client → pipelining
//! ```
//!
//! # Design Decisions
//! - Every thread group is a fixed-size tokio runtime
//! - Ordered shutdown: stop channels first, then the pools that serve them
//! - Shutdown has a deadline and is idempotent

pub mod groups;
pub mod pool;

pub use groups::{ResourceGroups, PIPELINING_THREAD_COUNT};
pub use pool::ThreadPool;
