//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection / QUIC connection
//!     → registry.rs (channel tracked for shutdown)
//!     → tls.rs (TLS handshake, ALPN picks the HTTP version)
//!     → session.rs (server-side session resumption cache)
//!     → connection.rs (ConnectionHandle routes codec events to exchanges)
//!     → Hand off to the application's connection initializer
//! ```
//!
//! # Design Decisions
//! - Each channel is tracked for shutdown
//! - TLS contexts are built once per listener and shared
//! - HTTP/3 always runs over TLS 1.3

pub mod connection;
pub mod registry;
pub mod session;
pub mod tls;

pub use connection::{CodecEvent, ConnectionHandle, ConnectionId, HttpVersion};
pub use registry::{ChannelGuard, ChannelRegistry};
pub use tls::{TlsContext, TlsError};
