//! Client connector: pooled outbound connections.
//!
//! # Responsibilities
//! - Lease an idle connection for the destination, or dial a new one
//! - Dial on the client group with a connect timeout, then TLS when configured
//! - Return reusable connections to the pool

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::{ClientBootstrapConfig, ConfigError, SenderConfig};
use crate::connector::server::{negotiated_version, BoxedIo};
use crate::error::TransportError;
use crate::lifecycle::ResourceGroups;
use crate::net::connection::{ConnectionHandle, HttpVersion};
use crate::net::tls::TlsContext;
use crate::pool::{Checkout, ConnectionPool, PoolKey};

/// One outbound connection.
pub struct ClientConnection {
    key: PoolKey,
    handle: ConnectionHandle,
    io: BoxedIo,
    /// Present while the connection is outside the pool.
    checkout: Option<Checkout>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("key", &self.key)
            .field("handle", &self.handle)
            .finish()
    }
}

impl ClientConnection {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ConnectionHandle {
        &mut self.handle
    }

    pub fn io(&mut self) -> &mut BoxedIo {
        &mut self.io
    }

    pub fn is_reusable(&self) -> bool {
        self.handle.is_reusable()
    }
}

/// Shared pool type of client connectors.
pub type ClientPool = ConnectionPool<ClientConnection>;

/// Outbound connector for one sender configuration.
#[derive(Debug)]
pub struct ClientConnector {
    version: HttpVersion,
    fingerprint: u64,
    bootstrap: ClientBootstrapConfig,
    idle_timeout: Duration,
    tls: Option<Arc<TlsContext>>,
    pool: Arc<ClientPool>,
    groups: Arc<ResourceGroups>,
}

impl ClientConnector {
    pub(crate) fn new(
        sender: &SenderConfig,
        version: HttpVersion,
        bootstrap: ClientBootstrapConfig,
        tls: Option<Arc<TlsContext>>,
        pool: Arc<ClientPool>,
        groups: Arc<ResourceGroups>,
    ) -> Self {
        let fingerprint = bootstrap.config_hash.unwrap_or_else(|| sender.fingerprint());
        Self {
            version,
            fingerprint,
            bootstrap,
            idle_timeout: Duration::from_secs(sender.socket_idle_timeout_secs),
            tls,
            pool,
            groups,
        }
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    pub fn tls_context(&self) -> Option<&Arc<TlsContext>> {
        self.tls.as_ref()
    }

    pub fn key(&self, authority: &str) -> PoolKey {
        PoolKey::new(authority, self.fingerprint)
    }

    /// Lease a pooled connection to `authority` or open a new one.
    pub async fn connect(&self, authority: &str) -> Result<ClientConnection, TransportError> {
        let key = self.key(authority);
        while let Some((mut conn, checkout)) = self.pool.try_lease(&key) {
            if conn.is_reusable() {
                tracing::trace!(key = %key, connection_id = %conn.handle.id(), "Reusing pooled connection");
                conn.checkout = Some(checkout);
                return Ok(conn);
            }
        }
        if let Some((mut conn, checkout)) = self.pool.lease(&key).await {
            if conn.is_reusable() {
                conn.checkout = Some(checkout);
                return Ok(conn);
            }
        }

        let dial = Dial {
            checkout: self.pool.checkout(&key),
            key,
            version: self.version,
            tls: self.tls.clone(),
            tcp_nodelay: self.bootstrap.tcp_nodelay,
            connect_timeout: Duration::from_millis(self.bootstrap.connect_timeout_ms),
            idle_timeout: self.idle_timeout,
        };
        self.groups
            .client()
            .spawn(dial.run())
            .await
            .map_err(|e| std::io::Error::other(format!("connect task failed: {}", e)))?
    }

    /// Return a connection for reuse. Closed or busy connections are dropped.
    pub fn release(&self, mut conn: ClientConnection) -> bool {
        let checkout = conn.checkout.take();
        if !conn.is_reusable() {
            tracing::debug!(connection_id = %conn.handle.id(), "Dropping non-reusable connection");
            return false;
        }
        let key = conn.key.clone();
        let kept = self.pool.release(&key, conn);
        drop(checkout);
        kept
    }
}

struct Dial {
    key: PoolKey,
    checkout: Checkout,
    version: HttpVersion,
    tls: Option<Arc<TlsContext>>,
    tcp_nodelay: bool,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl Dial {
    async fn run(self) -> Result<ClientConnection, TransportError> {
        let authority = self.key.authority.as_str();
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(authority))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", authority),
                )
            })??;
        stream.set_nodelay(self.tcp_nodelay)?;

        let (io, version): (BoxedIo, HttpVersion) =
            match self.tls.as_ref().and_then(|ctx| ctx.client_config()) {
                Some(config) => {
                    let name = server_name(authority)?;
                    let tls = TlsConnector::from(config).connect(name, stream).await?;
                    let alpn = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
                    let version = negotiated_version(alpn.as_deref(), self.version);
                    (Box::new(tls) as BoxedIo, version)
                }
                None => (Box::new(stream) as BoxedIo, self.version),
            };

        let handle = ConnectionHandle::new(version, self.tls.clone(), self.idle_timeout, Instant::now());
        tracing::debug!(
            connection_id = %handle.id(),
            authority = %authority,
            version = %version,
            "Outbound connection established"
        );
        Ok(ClientConnection {
            key: self.key,
            handle,
            io,
            checkout: Some(self.checkout),
        })
    }
}

/// TLS server name of a `host:port` authority.
fn server_name(authority: &str) -> Result<ServerName<'static>, ConfigError> {
    let host = authority
        .rsplit_once(':')
        .map_or(authority, |(host, _)| host)
        .trim_start_matches('[')
        .trim_end_matches(']');
    ServerName::try_from(host.to_string()).map_err(|_| ConfigError::InvalidAddress(authority.to_string()))
}
