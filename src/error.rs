//! Error taxonomy of the transport.
//!
//! Only [`TransportError::Configuration`] crosses the connector-creation
//! boundary; exchange failures surface as terminal states plus
//! [`ExchangeNotice::Failed`](crate::exchange::ExchangeNotice::Failed).

pub use crate::config::ConfigError;

/// Top-level error of connector construction and lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),
}

impl From<crate::net::tls::TlsError> for TransportError {
    fn from(e: crate::net::tls::TlsError) -> Self {
        TransportError::Configuration(ConfigError::Tls(e))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(e))
    }
}

/// Terminal failure of a single exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("stream idle timeout")]
    Timeout,
    #[error("connection closed abruptly: {0}")]
    AbruptClosure(String),
    #[error("stream reset by peer: {0}")]
    StreamReset(String),
}

/// Failure while releasing channels and thread pools.
///
/// Shutdown keeps releasing the remaining resources before reporting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShutdownError {
    /// Blocking shutdown was requested from inside an async runtime; pools
    /// were released in the background without waiting.
    #[error("shutdown interrupted: {0}")]
    Interrupted(String),
    #[error("resources not released before the deadline: {}", .0.join(", "))]
    Incomplete(Vec<String>),
}
