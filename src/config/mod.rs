//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → TransportConfig (validated, immutable)
//!     → ListenerConfig / SenderConfig handed to the connector factory
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; connectors never observe partial changes
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ChunkConfig, ClientAuth, ClientBootstrapConfig, KeepAliveConfig, KeyStoreConfig,
    ListenerConfig, MessageSizeConfig, ObservabilityConfig, PoolConfig, SenderConfig,
    ServerBootstrapConfig, SslConfig, ThreadCounts, TransportConfig, TransportProperties,
    WebSocketClientConfig, CLIENT_CONFIG_HASH_CODE, CONNECT_TIMEOUT_MS, HTTP_1_1, HTTP_2_0,
    HTTP_3_0, TCP_NODELAY,
};
pub use validation::ValidationError;
