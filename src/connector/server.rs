//! Server connector: bind, accept, TLS, and hand-off to the codec layer.
//!
//! # Responsibilities
//! - Bind TCP (HTTP/1.1, HTTP/2) or QUIC (HTTP/3) on the configured address
//! - Enforce max_connections via semaphore
//! - Register every accepted channel for shutdown
//! - Run the TLS accept and pick the HTTP version from ALPN
//! - Pin each connection to one task and hand it to the initializer

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio_rustls::TlsAcceptor;

use crate::config::{
    ChunkConfig, ConfigError, KeepAliveConfig, ListenerConfig, MessageSizeConfig,
    ServerBootstrapConfig,
};
use crate::error::TransportError;
use crate::lifecycle::ResourceGroups;
use crate::net::connection::{ConnectionHandle, ConnectionId, HttpVersion};
use crate::net::registry::ChannelGuard;
use crate::net::tls::{TlsContext, TlsError, ALPN_H2, ALPN_HTTP_1_1};

/// Byte stream of an accepted or dialed connection, TLS or not.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

pub type BoxedIo = Box<dyn AsyncReadWrite>;

/// Transport the codec layer frames.
pub enum Transport {
    Stream(BoxedIo),
    Quic(quinn::Connection),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Stream(_) => f.write_str("Transport::Stream"),
            Transport::Quic(conn) => write!(f, "Transport::Quic({})", conn.remote_address()),
        }
    }
}

/// A connection ready for its codec.
#[derive(Debug)]
pub struct AcceptedConnection {
    pub handle: ConnectionHandle,
    pub transport: Transport,
    pub peer: SocketAddr,
    pub bootstrap: Arc<ServerBootstrap>,
    /// Group for ordered pipelined writes, when the listener pipelines.
    pub pipelining: Option<Handle>,
}

/// Codec seam: drives one accepted connection until it closes.
///
/// The returned future runs on the worker group. It is dropped when
/// shutdown closes the channel.
pub trait ConnectionInitializer: Send + Sync + 'static {
    fn initialize(&self, connection: AcceptedConnection) -> BoxFuture<'static, ()>;
}

impl<F> ConnectionInitializer for F
where
    F: Fn(AcceptedConnection) -> BoxFuture<'static, ()> + Send + Sync + 'static,
{
    fn initialize(&self, connection: AcceptedConnection) -> BoxFuture<'static, ()> {
        self(connection)
    }
}

/// HTTP/3 transport wiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http3Settings {
    pub idle_timeout: Duration,
    pub keep_alive_interval: Option<Duration>,
}

/// Everything a server connector was built from. The codec-facing settings
/// are carried for the codec layer and not interpreted here.
#[derive(Debug)]
pub struct ServerBootstrap {
    pub listener_id: String,
    pub authority: String,
    pub version: HttpVersion,
    pub http2_enabled: bool,
    pub tls: Option<Arc<TlsContext>>,
    pub socket: ServerBootstrapConfig,
    pub idle_timeout: Duration,
    pub max_connections: usize,
    pub pipelining_limit: Option<usize>,
    pub http3: Option<Http3Settings>,
    pub keep_alive: KeepAliveConfig,
    pub chunking: ChunkConfig,
    pub server_header: String,
    pub message_size: MessageSizeConfig,
    pub websocket_compression_enabled: bool,
    pub access_log_enabled: bool,
    pub trace_log_enabled: bool,
}

impl ServerBootstrap {
    pub(crate) fn new(
        socket: &ServerBootstrapConfig,
        listener: &ListenerConfig,
        version: HttpVersion,
        tls: Option<Arc<TlsContext>>,
    ) -> Self {
        let idle_timeout = Duration::from_secs(listener.socket_idle_timeout_secs);
        let http3 = (version == HttpVersion::Http3).then(|| Http3Settings {
            idle_timeout,
            keep_alive_interval: match listener.keep_alive {
                KeepAliveConfig::Never => None,
                _ => Some(idle_timeout / 2),
            },
        });
        let pipelining_limit = (listener.pipelining_enabled && version == HttpVersion::Http11)
            .then_some(listener.pipelining_limit);

        Self {
            listener_id: listener.id.clone(),
            authority: listener.authority(),
            version,
            http2_enabled: version == HttpVersion::Http2,
            tls,
            socket: socket.clone(),
            idle_timeout,
            max_connections: listener.max_connections,
            pipelining_limit,
            http3,
            keep_alive: listener.keep_alive,
            chunking: listener.chunking,
            server_header: listener.server_header.clone(),
            message_size: listener.message_size.clone(),
            websocket_compression_enabled: listener.websocket_compression_enabled,
            access_log_enabled: listener.http_access_log_enabled,
            trace_log_enabled: listener.http_trace_log_enabled,
        }
    }

    /// Fresh handle for a connection registered as `id`.
    pub fn connection_handle(&self, id: ConnectionId, version: HttpVersion) -> ConnectionHandle {
        let handle = ConnectionHandle::new(version, self.tls.clone(), self.idle_timeout, Instant::now())
            .with_id(id);
        match self.pipelining_limit {
            Some(limit) if version == HttpVersion::Http11 => handle.with_pipelining(limit),
            _ => handle,
        }
    }
}

/// A listening endpoint for one host:port.
#[derive(Debug)]
pub struct ServerConnector {
    bootstrap: Arc<ServerBootstrap>,
    groups: Arc<ResourceGroups>,
    pipelining: Option<Handle>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ServerConnector {
    pub(crate) fn new(
        bootstrap: ServerBootstrap,
        groups: Arc<ResourceGroups>,
        pipelining: Option<Handle>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            bootstrap: Arc::new(bootstrap),
            groups,
            pipelining,
            stop_tx,
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        }
    }

    pub fn bootstrap(&self) -> &Arc<ServerBootstrap> {
        &self.bootstrap
    }

    pub fn tls_context(&self) -> Option<&Arc<TlsContext>> {
        self.bootstrap.tls.as_ref()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local address mutex poisoned")
    }

    /// Bind and start accepting. Returns the bound address.
    pub fn start(
        &self,
        initializer: Arc<dyn ConnectionInitializer>,
    ) -> Result<SocketAddr, TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("listener '{}' already started", self.bootstrap.listener_id),
            )
            .into());
        }
        if self.groups.is_shut_down() {
            return Err(std::io::Error::other("resource groups are shut down").into());
        }

        let addr = resolve(&self.bootstrap.authority)?;
        let local = match self.bootstrap.version {
            HttpVersion::Http3 => self.start_quic(addr, initializer)?,
            _ => self.start_tcp(addr, initializer)?,
        };

        *self.local_addr.lock().expect("local address mutex poisoned") = Some(local);
        tracing::info!(
            listener = %self.bootstrap.listener_id,
            address = %local,
            version = %self.bootstrap.version,
            tls = self.bootstrap.tls.is_some(),
            max_connections = self.bootstrap.max_connections,
            "Listener bound"
        );
        Ok(local)
    }

    /// Stop accepting. Established connections keep running.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        tracing::info!(listener = %self.bootstrap.listener_id, "Listener stopping");
    }

    fn start_tcp(
        &self,
        addr: SocketAddr,
        initializer: Arc<dyn ConnectionInitializer>,
    ) -> Result<SocketAddr, TransportError> {
        let acceptor = self.groups.acceptor();
        let listener = {
            let _enter = acceptor.enter();
            bind_tcp(addr, &self.bootstrap.socket)?
        };
        let local = listener.local_addr()?;

        let tls = match &self.bootstrap.tls {
            Some(ctx) => Some(TlsAcceptor::from(
                ctx.server_config()
                    .ok_or_else(|| ConfigError::MissingTls(self.bootstrap.listener_id.clone()))?,
            )),
            None => None,
        };

        acceptor.spawn(accept_loop(
            listener,
            tls,
            Arc::clone(&self.bootstrap),
            Arc::clone(&self.groups),
            self.pipelining.clone(),
            initializer,
            self.stop_tx.subscribe(),
        ));
        Ok(local)
    }

    fn start_quic(
        &self,
        addr: SocketAddr,
        initializer: Arc<dyn ConnectionInitializer>,
    ) -> Result<SocketAddr, TransportError> {
        let crypto = self
            .bootstrap
            .tls
            .as_ref()
            .and_then(|ctx| ctx.quic_config())
            .ok_or_else(|| ConfigError::MissingTls(format!("HTTP/3 listener '{}'", self.bootstrap.listener_id)))?;

        let mut server_config = quinn::ServerConfig::with_crypto(crypto);
        if let Some(http3) = &self.bootstrap.http3 {
            let mut transport = quinn::TransportConfig::default();
            let idle = quinn::IdleTimeout::try_from(http3.idle_timeout)
                .map_err(|e| TlsError::Quic(e.to_string()))?;
            transport.max_idle_timeout(Some(idle));
            transport.keep_alive_interval(http3.keep_alive_interval);
            server_config.transport_config(Arc::new(transport));
        }

        let http3 = self.groups.http3();
        let endpoint = {
            let _enter = http3.enter();
            quinn::Endpoint::server(server_config, addr)?
        };
        let local = endpoint.local_addr()?;

        http3.spawn(quic_accept_loop(
            endpoint,
            Arc::clone(&self.bootstrap),
            Arc::clone(&self.groups),
            initializer,
            self.stop_tx.subscribe(),
        ));
        Ok(local)
    }
}

fn resolve(authority: &str) -> Result<SocketAddr, ConfigError> {
    authority
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::InvalidAddress(authority.to_string()))
}

fn bind_tcp(addr: SocketAddr, options: &ServerBootstrapConfig) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(options.so_reuseaddr)?;
    if options.receive_buffer_size > 0 {
        socket.set_recv_buffer_size(options.receive_buffer_size)?;
    }
    if options.send_buffer_size > 0 {
        socket.set_send_buffer_size(options.send_buffer_size)?;
    }
    socket.bind(addr)?;
    socket.listen(options.so_backlog)
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    bootstrap: Arc<ServerBootstrap>,
    groups: Arc<ResourceGroups>,
    pipelining: Option<Handle>,
    initializer: Arc<dyn ConnectionInitializer>,
    mut stop: watch::Receiver<bool>,
) {
    let limit = Arc::new(Semaphore::new(bootstrap.max_connections));

    loop {
        // Acquire permit first (backpressure)
        let permit = tokio::select! {
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = stop.changed() => break,
        };

        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(listener = %bootstrap.listener_id, error = %e, "Failed to accept connection");
                    continue;
                }
            },
            _ = stop.changed() => break,
        };

        if bootstrap.socket.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let guard = groups.channels().register(peer);
        tracing::debug!(
            connection_id = %guard.id(),
            peer = %peer,
            available_permits = limit.available_permits(),
            "Connection accepted"
        );

        let tls = tls.clone();
        let bootstrap = Arc::clone(&bootstrap);
        let pipelining = pipelining.clone();
        let initializer = Arc::clone(&initializer);
        groups.worker().spawn(async move {
            serve_stream(stream, peer, guard, tls, bootstrap, pipelining, initializer).await;
            drop(permit);
        });
    }

    tracing::info!(listener = %bootstrap.listener_id, "Accept loop stopped");
}

async fn serve_stream(
    stream: TcpStream,
    peer: SocketAddr,
    mut guard: ChannelGuard,
    tls: Option<TlsAcceptor>,
    bootstrap: Arc<ServerBootstrap>,
    pipelining: Option<Handle>,
    initializer: Arc<dyn ConnectionInitializer>,
) {
    let (transport, version): (BoxedIo, HttpVersion) = match tls {
        Some(acceptor) => {
            let handshake = tokio::select! {
                result = tokio::time::timeout(bootstrap.idle_timeout, acceptor.accept(stream)) => result,
                _ = guard.closed() => return,
            };
            match handshake {
                Ok(Ok(tls_stream)) => {
                    let alpn = tls_stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
                    let version = negotiated_version(alpn.as_deref(), bootstrap.version);
                    (Box::new(tls_stream) as BoxedIo, version)
                }
                Ok(Err(e)) => {
                    tracing::debug!(connection_id = %guard.id(), peer = %peer, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(connection_id = %guard.id(), peer = %peer, "TLS handshake timed out");
                    return;
                }
            }
        }
        None => (Box::new(stream) as BoxedIo, bootstrap.version),
    };

    let connection = AcceptedConnection {
        handle: bootstrap.connection_handle(guard.id(), version),
        transport: Transport::Stream(transport),
        peer,
        bootstrap: Arc::clone(&bootstrap),
        pipelining,
    };

    tokio::select! {
        _ = initializer.initialize(connection) => {
            tracing::trace!(connection_id = %guard.id(), "Connection finished");
        }
        _ = guard.closed() => {
            tracing::debug!(connection_id = %guard.id(), "Connection closed by shutdown");
        }
    }
}

async fn quic_accept_loop(
    endpoint: quinn::Endpoint,
    bootstrap: Arc<ServerBootstrap>,
    groups: Arc<ResourceGroups>,
    initializer: Arc<dyn ConnectionInitializer>,
    mut stop: watch::Receiver<bool>,
) {
    let limit = Arc::new(Semaphore::new(bootstrap.max_connections));

    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = stop.changed() => break,
        };

        let incoming = tokio::select! {
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
            _ = stop.changed() => break,
        };

        let peer = incoming.remote_address();
        let mut guard = groups.channels().register(peer);
        let bootstrap = Arc::clone(&bootstrap);
        let initializer = Arc::clone(&initializer);

        groups.http3().spawn(async move {
            let connecting = match incoming.accept() {
                Ok(connecting) => connecting,
                Err(e) => {
                    tracing::debug!(connection_id = %guard.id(), peer = %peer, error = %e, "QUIC connection refused");
                    return;
                }
            };
            let handshake = tokio::select! {
                result = connecting => result,
                _ = guard.closed() => return,
            };
            let connection = match handshake {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::debug!(connection_id = %guard.id(), peer = %peer, error = %e, "QUIC handshake failed");
                    return;
                }
            };

            let accepted = AcceptedConnection {
                handle: bootstrap.connection_handle(guard.id(), HttpVersion::Http3),
                transport: Transport::Quic(connection.clone()),
                peer,
                bootstrap: Arc::clone(&bootstrap),
                pipelining: None,
            };

            tokio::select! {
                _ = initializer.initialize(accepted) => {}
                _ = guard.closed() => {
                    connection.close(0u32.into(), b"shutdown");
                }
            }
            drop(permit);
        });
    }

    endpoint.close(0u32.into(), b"listener stopped");
    tracing::info!(listener = %bootstrap.listener_id, "QUIC accept loop stopped");
}

/// HTTP version a TLS connection settled on.
pub(crate) fn negotiated_version(alpn: Option<&[u8]>, configured: HttpVersion) -> HttpVersion {
    match alpn {
        Some(p) if p == ALPN_H2 => HttpVersion::Http2,
        Some(p) if p == ALPN_HTTP_1_1 => HttpVersion::Http11,
        _ => configured,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_overrides_configured_version() {
        assert_eq!(negotiated_version(Some(b"h2"), HttpVersion::Http11), HttpVersion::Http2);
        assert_eq!(negotiated_version(Some(b"http/1.1"), HttpVersion::Http2), HttpVersion::Http11);
        assert_eq!(negotiated_version(None, HttpVersion::Http2), HttpVersion::Http2);
    }

    #[test]
    fn bootstrap_carries_pipelining_only_for_http11() {
        let listener = ListenerConfig {
            pipelining_enabled: true,
            pipelining_limit: 3,
            ..ListenerConfig::default()
        };
        let plain = ServerBootstrap::new(&ServerBootstrapConfig::default(), &listener, HttpVersion::Http11, None);
        assert_eq!(plain.pipelining_limit, Some(3));
        assert!(!plain.http2_enabled);

        let h2 = ServerBootstrap::new(&ServerBootstrapConfig::default(), &listener, HttpVersion::Http2, None);
        assert_eq!(h2.pipelining_limit, None);
        assert!(h2.http2_enabled);
    }

    #[test]
    fn http3_keep_alive_follows_listener_setting() {
        let listener = ListenerConfig {
            socket_idle_timeout_secs: 40,
            keep_alive: KeepAliveConfig::Always,
            ..ListenerConfig::default()
        };
        let bootstrap = ServerBootstrap::new(&ServerBootstrapConfig::default(), &listener, HttpVersion::Http3, None);
        assert_eq!(
            bootstrap.http3,
            Some(Http3Settings {
                idle_timeout: Duration::from_secs(40),
                keep_alive_interval: Some(Duration::from_secs(20)),
            })
        );
    }

    #[test]
    fn unresolvable_authority_is_a_configuration_error() {
        assert!(matches!(resolve("not an address"), Err(ConfigError::InvalidAddress(_))));
        assert!(resolve("127.0.0.1:0").is_ok());
    }
}
