//! WebSocket client connector.
//!
//! # Responsibilities
//! - Dial `ws://` or `wss://` targets on the client group
//! - Perform the upgrade handshake with requested subprotocols and headers
//! - Enforce an idle timeout on the upgraded stream

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::{HeaderName, HeaderValue};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::config::{ConfigError, WebSocketClientConfig};
use crate::connector::server::BoxedIo;
use crate::error::{ExchangeError, TransportError};
use crate::lifecycle::ResourceGroups;
use crate::net::connection::{ConnectionHandle, HttpVersion};
use crate::net::tls::TlsContext;

/// Validated target of a WebSocket connector.
#[derive(Debug, Clone)]
struct Target {
    url: Url,
    host: String,
    port: u16,
    secure: bool,
}

impl Target {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => return Err(invalid(&format!("unsupported scheme '{}'", other))),
        };
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?.to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        Ok(Self {
            url,
            host,
            port,
            secure,
        })
    }
}

/// Outbound WebSocket connector for one target.
#[derive(Debug)]
pub struct WebSocketClientConnector {
    config: WebSocketClientConfig,
    target: Target,
    tls: Option<Arc<TlsContext>>,
    groups: Arc<ResourceGroups>,
}

impl WebSocketClientConnector {
    pub(crate) fn new(
        config: &WebSocketClientConfig,
        tls: Option<Arc<TlsContext>>,
        groups: Arc<ResourceGroups>,
    ) -> Result<Self, ConfigError> {
        let target = Target::parse(&config.url)?;
        if target.secure && tls.is_none() {
            return Err(ConfigError::MissingTls(format!("WebSocket target {}", config.url)));
        }
        if config.compression_enabled {
            tracing::warn!(url = %config.url, "WebSocket compression is not supported, continuing without it");
        }
        Ok(Self {
            config: config.clone(),
            target,
            tls,
            groups,
        })
    }

    pub fn url(&self) -> &Url {
        &self.target.url
    }

    /// Dial and upgrade.
    pub async fn connect(&self) -> Result<WebSocketConnection, TransportError> {
        let request = self.handshake_request()?;
        let target = self.target.clone();
        let tls = self.tls.clone();
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_frame_size = Some(self.config.max_frame_size);

        self.groups
            .client()
            .spawn(async move {
                let io = dial(&target, tls.as_deref(), connect_timeout).await?;
                let (stream, response) =
                    tokio_tungstenite::client_async_with_config(request, io, Some(ws_config)).await?;

                let subprotocol = response
                    .headers()
                    .get(SEC_WEBSOCKET_PROTOCOL)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let handle = ConnectionHandle::new(HttpVersion::Http11, tls, idle_timeout, Instant::now());
                tracing::debug!(
                    connection_id = %handle.id(),
                    url = %target.url,
                    subprotocol = ?subprotocol,
                    "WebSocket connection upgraded"
                );

                Ok(WebSocketConnection {
                    stream,
                    handle,
                    subprotocol,
                    idle_timeout,
                })
            })
            .await
            .map_err(|e| std::io::Error::other(format!("WebSocket connect task failed: {}", e)))?
    }

    fn handshake_request(&self) -> Result<http::Request<()>, TransportError> {
        let mut request = self.target.url.as_str().into_client_request()?;
        let headers = request.headers_mut();

        for (name, value) in &self.config.headers {
            let invalid = || ConfigError::InvalidUrl {
                url: self.config.url.clone(),
                reason: format!("invalid handshake header '{}'", name),
            };
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            headers.insert(name, value);
        }

        if !self.config.sub_protocols.is_empty() {
            let joined = self.config.sub_protocols.join(", ");
            let value = HeaderValue::from_str(&joined).map_err(|_| ConfigError::InvalidUrl {
                url: self.config.url.clone(),
                reason: "invalid subprotocol list".to_string(),
            })?;
            headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
        Ok(request)
    }
}

async fn dial(
    target: &Target,
    tls: Option<&TlsContext>,
    connect_timeout: Duration,
) -> Result<BoxedIo, TransportError> {
    let stream = tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {} timed out", target.url),
        )
    })??;
    stream.set_nodelay(true)?;

    match tls.and_then(TlsContext::client_config) {
        Some(config) if target.secure => {
            let name = ServerName::try_from(target.host.clone())
                .map_err(|_| ConfigError::InvalidAddress(target.host.clone()))?;
            let tls = TlsConnector::from(config).connect(name, stream).await?;
            Ok(Box::new(tls))
        }
        _ => Ok(Box::new(stream)),
    }
}

/// An upgraded WebSocket stream.
pub struct WebSocketConnection {
    stream: WebSocketStream<BoxedIo>,
    handle: ConnectionHandle,
    subprotocol: Option<String>,
    idle_timeout: Duration,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("handle", &self.handle)
            .field("subprotocol", &self.subprotocol)
            .finish()
    }
}

impl WebSocketConnection {
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Subprotocol the server selected, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Next message. Fails with a timeout when nothing arrives within the
    /// idle timeout; `None` once the peer has closed.
    pub async fn recv(&mut self) -> Option<Result<Message, TransportError>> {
        match tokio::time::timeout(self.idle_timeout, self.stream.next()).await {
            Ok(Some(Ok(message))) => Some(Ok(message)),
            Ok(Some(Err(e))) => Some(Err(e.into())),
            Ok(None) => None,
            Err(_) => {
                tracing::debug!(connection_id = %self.handle.id(), "WebSocket idle timeout");
                Some(Err(ExchangeError::Timeout.into()))
            }
        }
    }

    pub async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        self.stream.send(message).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ws_and_wss_targets() {
        let plain = Target::parse("ws://example.com/chat").unwrap();
        assert_eq!((plain.port, plain.secure), (80, false));

        let secure = Target::parse("wss://example.com:9443/chat").unwrap();
        assert_eq!((secure.host.as_str(), secure.port, secure.secure), ("example.com", 9443, true));
    }

    #[test]
    fn rejects_non_websocket_schemes() {
        assert!(matches!(
            Target::parse("http://example.com"),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(Target::parse("not a url").is_err());
    }
}
