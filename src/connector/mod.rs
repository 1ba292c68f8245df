//! Connector factory subsystem.
//!
//! # Data Flow
//! ```text
//! ListenerConfig ──→ validate → TLS context → ServerBootstrap → ServerConnector
//! SenderConfig   ──→ validate → TLS context → ConnectionPool  → ClientConnector
//! WebSocketClientConfig ──→ URL check → TLS context → WebSocketClientConnector
//!
//! All connectors schedule work on the factory's ResourceGroups.
//! ```
//!
//! # Design Decisions
//! - Configuration errors fail creation; no connector is returned half built
//! - TLS contexts are built once per connector and shared by its connections
//! - The pipelining group exists only once a pipelining listener asks for it

pub mod client;
pub mod server;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use crate::config::validation::{validate_listener, validate_sender};
use crate::config::{
    ClientBootstrapConfig, ConfigError, ListenerConfig, SenderConfig, ServerBootstrapConfig,
    ThreadCounts, TransportProperties, ValidationError, WebSocketClientConfig,
};
use crate::error::TransportError;
use crate::lifecycle::ResourceGroups;
use crate::net::connection::HttpVersion;
use crate::net::tls::{build_client_context, build_server_context};
use crate::pool::ConnectionPool;

pub use client::{ClientConnection, ClientConnector, ClientPool};
pub use server::{
    AcceptedConnection, AsyncReadWrite, BoxedIo, ConnectionInitializer, Http3Settings,
    ServerBootstrap, ServerConnector, Transport,
};
pub use websocket::{WebSocketClientConnector, WebSocketConnection};

/// Default bound of each graceful shutdown step.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds connectors on one shared set of thread groups.
#[derive(Debug)]
pub struct ConnectorFactory {
    groups: Arc<ResourceGroups>,
}

impl ConnectorFactory {
    pub fn new(counts: ThreadCounts) -> Result<Self, TransportError> {
        let groups = ResourceGroups::new(&counts)?;
        tracing::info!(
            acceptor = counts.acceptor,
            worker = counts.worker,
            client = counts.client,
            http3 = counts.http3,
            "Connector factory initialized"
        );
        Ok(Self {
            groups: Arc::new(groups),
        })
    }

    /// Thread counts derived from the number of cores.
    pub fn with_defaults() -> Result<Self, TransportError> {
        Self::new(ThreadCounts::default())
    }

    pub fn groups(&self) -> &Arc<ResourceGroups> {
        &self.groups
    }

    pub fn create_server_connector(
        &self,
        bootstrap: &ServerBootstrapConfig,
        listener: &ListenerConfig,
    ) -> Result<ServerConnector, TransportError> {
        self.ensure_running()?;
        validate_listener(listener).map_err(ConfigError::Validation)?;
        let version = parse_version(&listener.version)?;

        let tls = match (&listener.ssl, version) {
            (Some(ssl), _) => Some(Arc::new(build_server_context(ssl, version)?)),
            (None, HttpVersion::Http3) => {
                return Err(ConfigError::MissingTls(format!("HTTP/3 listener '{}'", listener.id)).into())
            }
            (None, _) => None,
        };

        let pipelining = if listener.pipelining_enabled && version == HttpVersion::Http11 {
            Some(self.groups.pipelining_group()?)
        } else {
            if listener.pipelining_enabled {
                tracing::debug!(listener = %listener.id, version = %version, "Pipelining applies to HTTP/1.1 only, ignoring");
            }
            None
        };

        let server = ServerBootstrap::new(bootstrap, listener, version, tls);
        tracing::info!(
            listener = %listener.id,
            authority = %server.authority,
            version = %version,
            tls = server.tls.is_some(),
            pipelining = ?server.pipelining_limit,
            "Server connector created"
        );
        Ok(ServerConnector::new(server, Arc::clone(&self.groups), pipelining))
    }

    /// Client connector with a pool of its own.
    pub fn create_client_connector(
        &self,
        props: &TransportProperties,
        sender: &SenderConfig,
    ) -> Result<ClientConnector, TransportError> {
        let pool = Arc::new(ConnectionPool::new(&sender.pool));
        let connector = self.create_client_connector_with_pool(props, sender, Arc::clone(&pool))?;
        pool.spawn_evictor(self.groups.client());
        Ok(connector)
    }

    /// Client connector drawing from a pool shared with other connectors.
    pub fn create_client_connector_with_pool(
        &self,
        props: &TransportProperties,
        sender: &SenderConfig,
        pool: Arc<ClientPool>,
    ) -> Result<ClientConnector, TransportError> {
        self.ensure_running()?;
        validate_sender(sender).map_err(ConfigError::Validation)?;
        let version = parse_version(&sender.version)?;
        let tls = match &sender.ssl {
            Some(ssl) => Some(Arc::new(build_client_context(ssl, version)?)),
            None => None,
        };

        let bootstrap = ClientBootstrapConfig::from_properties(props);
        let connector = ClientConnector::new(sender, version, bootstrap, tls, pool, Arc::clone(&self.groups));
        tracing::debug!(
            version = %version,
            fingerprint = connector.fingerprint(),
            tls = connector.tls_context().is_some(),
            "Client connector created"
        );
        Ok(connector)
    }

    pub fn create_websocket_client_connector(
        &self,
        config: &WebSocketClientConfig,
    ) -> Result<WebSocketClientConnector, TransportError> {
        self.ensure_running()?;
        let tls = match &config.ssl {
            Some(ssl) => Some(Arc::new(build_client_context(ssl, HttpVersion::Http11)?)),
            None => None,
        };
        let connector = WebSocketClientConnector::new(config, tls, Arc::clone(&self.groups))?;
        tracing::debug!(url = %connector.url(), "WebSocket client connector created");
        Ok(connector)
    }

    /// Close every channel and stop the thread groups, waiting for each to
    /// drain. Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<(), TransportError> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), TransportError> {
        self.groups.shutdown(timeout)?;
        Ok(())
    }

    /// Same steps as [`shutdown`](Self::shutdown) without waiting.
    pub fn shutdown_now(&self) {
        self.groups.shutdown_now();
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.groups.is_shut_down() {
            return Err(std::io::Error::other("connector factory is shut down").into());
        }
        Ok(())
    }
}

fn parse_version(version: &str) -> Result<HttpVersion, ConfigError> {
    HttpVersion::parse(version).ok_or_else(|| {
        ConfigError::Validation(vec![ValidationError::new(
            "version",
            format!("unsupported HTTP version '{}'", version),
        )])
    })
}
