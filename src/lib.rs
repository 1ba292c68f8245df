//! HTTP transport core.
//!
//! Connector factory, per-exchange state machine and connection plumbing
//! shared by HTTP/1.1, HTTP/2, HTTP/3 and WebSocket transports. Codecs sit
//! above this crate and talk to it through [`net::CodecEvent`] and
//! [`exchange::ChannelWriter`].

pub mod config;
pub mod connector;
pub mod error;
pub mod exchange;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod pool;

pub use config::{load_config, TransportConfig};
pub use connector::{ClientConnector, ConnectorFactory, ServerConnector, WebSocketClientConnector};
pub use error::{ExchangeError, ShutdownError, TransportError};
pub use exchange::{ExchangeContext, ListenerState};
pub use net::{CodecEvent, ConnectionHandle, HttpVersion};
