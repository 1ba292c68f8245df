//! TLS listeners built from a certificate/key pair.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::mpsc;

use common::{driver, loopback_listener, small_factory, TestCerts};
use http_transport::config::{SenderConfig, ServerBootstrapConfig, TransportProperties};
use http_transport::connector::{AcceptedConnection, ConnectionInitializer};
use http_transport::net::tls::{ALPN_H2, ALPN_HTTP_1_1};
use http_transport::HttpVersion;

#[test]
fn http2_listener_advertises_h2_and_negotiates_it() {
    let certs = TestCerts::generate();
    let factory = small_factory();

    let listener = http_transport::config::ListenerConfig {
        ssl: Some(certs.server_ssl()),
        ..loopback_listener("h2", "2.0")
    };
    let connector = factory
        .create_server_connector(&ServerBootstrapConfig::default(), &listener)
        .unwrap();

    let tls = connector.tls_context().unwrap();
    assert!(tls.advertises(ALPN_H2));
    assert!(!tls.advertises(ALPN_HTTP_1_1));

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let initializer: Arc<dyn ConnectionInitializer> =
        Arc::new(move |conn: AcceptedConnection| -> BoxFuture<'static, ()> {
            let _ = seen_tx.send(conn.handle.version());
            async move {
                let _transport = conn.transport;
                futures_util::future::pending::<()>().await
            }
            .boxed()
        });
    let addr = connector.start(initializer).unwrap();

    let sender = SenderConfig {
        version: "2.0".to_string(),
        ssl: Some(certs.client_ssl()),
        ..SenderConfig::default()
    };
    let client = factory
        .create_client_connector(&TransportProperties::new(), &sender)
        .unwrap();

    let rt = driver();
    let (client_version, server_version) = rt.block_on(async {
        let conn = client
            .connect(&format!("localhost:{}", addr.port()))
            .await
            .unwrap();
        let server_version = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        (conn.handle().version(), server_version)
    });
    drop(rt);

    assert_eq!(client_version, HttpVersion::Http2);
    assert_eq!(server_version, HttpVersion::Http2);
    factory.shutdown().unwrap();
}

#[test]
fn http3_listener_binds_quic_endpoint() {
    let certs = TestCerts::generate();
    let factory = small_factory();

    let listener = http_transport::config::ListenerConfig {
        ssl: Some(certs.server_ssl()),
        ..loopback_listener("h3", "3.0")
    };
    let connector = factory
        .create_server_connector(&ServerBootstrapConfig::default(), &listener)
        .unwrap();
    assert!(connector.tls_context().unwrap().quic_config().is_some());

    let addr = connector.start(common::holding_initializer()).unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(connector.local_addr(), Some(addr));

    connector.stop();
    factory.shutdown().unwrap();
}
