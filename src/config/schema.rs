//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the transport.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Version string of an HTTP/1.1 listener or sender.
pub const HTTP_1_1: &str = "1.1";
/// Version string of an HTTP/2 listener or sender.
pub const HTTP_2_0: &str = "2.0";
/// Version string of an HTTP/3 (QUIC) listener.
pub const HTTP_3_0: &str = "3.0";

/// Root configuration for the transport daemon.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Socket options shared by every server connector.
    pub bootstrap: ServerBootstrapConfig,

    /// Thread pool sizes.
    pub threads: ThreadCounts,

    /// Listeners to start.
    pub listeners: Vec<ListenerConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Sizes of the fixed thread pools owned by the connector factory.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ThreadCounts {
    /// Threads accepting new connections.
    pub acceptor: usize,
    /// Threads owning accepted connections.
    pub worker: usize,
    /// Threads running outbound (client) connections.
    pub client: usize,
    /// Threads running HTTP/3 endpoints.
    pub http3: usize,
}

impl Default for ThreadCounts {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            acceptor: cores,
            worker: cores * 2,
            client: cores * 2,
            http3: cores,
        }
    }
}

/// Socket-level options applied to every server connector.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerBootstrapConfig {
    /// Listen backlog.
    pub so_backlog: u32,
    /// Set SO_REUSEADDR on the listening socket.
    pub so_reuseaddr: bool,
    /// Disable Nagle on accepted sockets.
    pub tcp_nodelay: bool,
    /// Receive buffer size in bytes (0 keeps the OS default).
    pub receive_buffer_size: u32,
    /// Send buffer size in bytes (0 keeps the OS default).
    pub send_buffer_size: u32,
}

impl Default for ServerBootstrapConfig {
    fn default() -> Self {
        Self {
            so_backlog: 1024,
            so_reuseaddr: true,
            tcp_nodelay: true,
            receive_buffer_size: 0,
            send_buffer_size: 0,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Listener identifier for logging.
    pub id: String,

    /// Host to bind.
    pub host: String,

    /// Port to bind (0 picks an ephemeral port).
    pub port: u16,

    /// Protocol version: "1.1", "2.0" or "3.0".
    pub version: String,

    /// Optional TLS configuration. Mandatory for "3.0".
    pub ssl: Option<SslConfig>,

    /// Idle timeout for connections and streams, in seconds.
    pub socket_idle_timeout_secs: u64,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Allow pipelined HTTP/1.1 requests.
    pub pipelining_enabled: bool,

    /// Maximum pipelined requests in flight per connection.
    pub pipelining_limit: usize,

    /// Negotiate permessage-deflate on WebSocket upgrades.
    pub websocket_compression_enabled: bool,

    /// Handed to the access log collaborator.
    pub http_access_log_enabled: bool,

    /// Handed to the trace log collaborator.
    pub http_trace_log_enabled: bool,

    /// Connection persistence policy.
    pub keep_alive: KeepAliveConfig,

    /// Chunked transfer policy for responses.
    pub chunking: ChunkConfig,

    /// Value of the `server` response header, empty to omit.
    pub server_header: String,

    /// Inbound message size limits.
    pub message_size: MessageSizeConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            host: "0.0.0.0".to_string(),
            port: 9090,
            version: HTTP_1_1.to_string(),
            ssl: None,
            socket_idle_timeout_secs: 60,
            max_connections: 10_000,
            pipelining_enabled: false,
            pipelining_limit: 10,
            websocket_compression_enabled: true,
            http_access_log_enabled: false,
            http_trace_log_enabled: false,
            keep_alive: KeepAliveConfig::Auto,
            chunking: ChunkConfig::Auto,
            server_header: "http-transport".to_string(),
            message_size: MessageSizeConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// `host:port` this listener binds.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection persistence policy.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum KeepAliveConfig {
    /// Follow the request's `connection` header.
    #[default]
    Auto,
    Always,
    Never,
}

/// Chunked transfer policy.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkConfig {
    #[default]
    Auto,
    Always,
    Never,
}

/// Inbound message size limits enforced by the codec layer.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MessageSizeConfig {
    pub max_initial_line_length: usize,
    pub max_header_size: usize,
    /// Negative values in other transports mean unlimited; here `None` does.
    pub max_entity_body_size: Option<usize>,
}

impl Default for MessageSizeConfig {
    fn default() -> Self {
        Self {
            max_initial_line_length: 4096,
            max_header_size: 8192,
            max_entity_body_size: None,
        }
    }
}

/// Client authentication policy of a server context.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    #[default]
    None,
    Optional,
    Require,
}

/// A PEM bundle carrying both the certificate chain and the private key.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct KeyStoreConfig {
    /// Path to the bundle.
    pub path: String,
}

/// TLS settings of a listener or sender.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct SslConfig {
    /// Keystore bundle. Takes precedence over the cert+key pair.
    pub key_store: Option<KeyStoreConfig>,

    /// Path to the certificate chain (PEM).
    pub certificate_file: Option<String>,

    /// Path to the private key (PEM).
    pub private_key_file: Option<String>,

    /// Path to trusted CA certificates (PEM).
    pub trust_certificates_file: Option<String>,

    /// Client certificate policy (server contexts only).
    pub client_auth: ClientAuth,

    /// Check peer certificates against the configured CRLs.
    pub validate_cert: bool,

    /// CRL files (PEM) used when `validate_cert` is on.
    pub revocation_lists: Vec<String>,

    /// Staple an OCSP response to the server certificate.
    pub ocsp_stapling: bool,

    /// DER-encoded OCSP response stapled when `ocsp_stapling` is on.
    pub ocsp_response_file: Option<String>,

    /// Maximum number of cached TLS sessions.
    pub session_cache_size: usize,

    /// Validity of a cached session, in seconds.
    pub session_timeout_secs: u64,

    /// Advertise http/1.1 next to h2 on HTTP/2 contexts.
    pub http2_fallback_enabled: bool,

    /// Disable server certificate verification (client contexts only).
    pub disable_verification: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            key_store: None,
            certificate_file: None,
            private_key_file: None,
            trust_certificates_file: None,
            client_auth: ClientAuth::None,
            validate_cert: false,
            revocation_lists: Vec::new(),
            ocsp_stapling: false,
            ocsp_response_file: None,
            session_cache_size: 50,
            session_timeout_secs: 86_400,
            http2_fallback_enabled: false,
            disable_verification: false,
        }
    }
}

/// Outbound (client) configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct SenderConfig {
    /// Protocol version: "1.1" or "2.0".
    pub version: String,

    /// TLS settings; `None` for plaintext.
    pub ssl: Option<SslConfig>,

    /// Idle timeout for outbound connections and streams, in seconds.
    pub socket_idle_timeout_secs: u64,

    /// Connection pool settings.
    pub pool: PoolConfig,

    /// Forwarded/keep-alive policy for outbound requests.
    pub keep_alive: KeepAliveConfig,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            version: HTTP_1_1.to_string(),
            ssl: None,
            socket_idle_timeout_secs: 60,
            pool: PoolConfig::default(),
            keep_alive: KeepAliveConfig::Auto,
        }
    }
}

impl SenderConfig {
    /// Fingerprint distinguishing pools of differently configured senders.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Client connection pool settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum idle connections kept per destination.
    pub max_idle_per_key: usize,

    /// How long a lease waits for an idle connection, in milliseconds.
    pub max_wait_ms: u64,

    /// Idle connections older than this are evicted, in seconds.
    pub idle_timeout_secs: u64,

    /// Interval of the background eviction sweep, in seconds.
    pub eviction_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_key: 100,
            max_wait_ms: 60,
            idle_timeout_secs: 300,
            eviction_interval_secs: 30,
        }
    }
}

/// Transport properties handed to client connectors as loose key/value pairs.
pub type TransportProperties = HashMap<String, String>;

/// Property carrying a caller-computed sender configuration hash.
pub const CLIENT_CONFIG_HASH_CODE: &str = "client.config.hash.code";
/// Property toggling TCP_NODELAY on outbound sockets.
pub const TCP_NODELAY: &str = "tcp.nodelay";
/// Property carrying the outbound connect timeout in milliseconds.
pub const CONNECT_TIMEOUT_MS: &str = "connect.timeout.ms";

/// Socket options of outbound connections, parsed from transport properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientBootstrapConfig {
    pub tcp_nodelay: bool,
    pub connect_timeout_ms: u64,
    /// Explicit pool fingerprint, if the caller supplied one.
    pub config_hash: Option<u64>,
}

impl Default for ClientBootstrapConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            connect_timeout_ms: 15_000,
            config_hash: None,
        }
    }
}

impl ClientBootstrapConfig {
    /// Parse known keys, ignoring malformed values.
    pub fn from_properties(props: &TransportProperties) -> Self {
        let defaults = Self::default();
        Self {
            tcp_nodelay: props
                .get(TCP_NODELAY)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.tcp_nodelay),
            connect_timeout_ms: props
                .get(CONNECT_TIMEOUT_MS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_timeout_ms),
            config_hash: props
                .get(CLIENT_CONFIG_HASH_CODE)
                .and_then(|v| v.parse().ok()),
        }
    }
}

/// WebSocket client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketClientConfig {
    /// Target URL (`ws://` or `wss://`).
    pub url: String,

    /// Requested subprotocols.
    pub sub_protocols: Vec<String>,

    /// Extra handshake headers.
    pub headers: HashMap<String, String>,

    /// Idle timeout of the upgraded stream, in seconds.
    pub idle_timeout_secs: u64,

    /// Maximum accepted frame size in bytes.
    pub max_frame_size: usize,

    /// Ask for permessage-deflate.
    pub compression_enabled: bool,

    /// TLS settings for `wss://`.
    pub ssl: Option<SslConfig>,

    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for WebSocketClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            sub_protocols: Vec::new(),
            headers: HashMap::new(),
            idle_timeout_secs: 60,
            max_frame_size: 64 * 1024,
            compression_enabled: false,
            ssl: None,
            connect_timeout_ms: 15_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9091".to_string(),
        }
    }
}
