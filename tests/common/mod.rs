//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tempfile::TempDir;

use http_transport::config::{ListenerConfig, SslConfig, ThreadCounts};
use http_transport::connector::{AcceptedConnection, ConnectionInitializer};
use http_transport::ConnectorFactory;

/// Self-signed certificate for `localhost`, written as PEM files.
pub struct TestCerts {
    _dir: TempDir,
    pub cert_path: String,
    pub key_path: String,
}

impl TestCerts {
    pub fn generate() -> Self {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::File::create(&cert_path)
            .unwrap()
            .write_all(generated.cert.pem().as_bytes())
            .unwrap();
        std::fs::File::create(&key_path)
            .unwrap()
            .write_all(generated.key_pair.serialize_pem().as_bytes())
            .unwrap();

        Self {
            cert_path: cert_path.to_string_lossy().into_owned(),
            key_path: key_path.to_string_lossy().into_owned(),
            _dir: dir,
        }
    }

    pub fn server_ssl(&self) -> SslConfig {
        SslConfig {
            certificate_file: Some(self.cert_path.clone()),
            private_key_file: Some(self.key_path.clone()),
            ..SslConfig::default()
        }
    }

    /// Client settings trusting this certificate.
    pub fn client_ssl(&self) -> SslConfig {
        SslConfig {
            trust_certificates_file: Some(self.cert_path.clone()),
            ..SslConfig::default()
        }
    }
}

/// Factory with one thread per fixed group.
pub fn small_factory() -> ConnectorFactory {
    ConnectorFactory::new(ThreadCounts {
        acceptor: 1,
        worker: 2,
        client: 1,
        http3: 1,
    })
    .unwrap()
}

/// Listener on an ephemeral loopback port.
pub fn loopback_listener(id: &str, version: &str) -> ListenerConfig {
    ListenerConfig {
        id: id.to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        version: version.to_string(),
        ..ListenerConfig::default()
    }
}

/// Initializer that keeps every connection open until shutdown closes it.
pub fn holding_initializer() -> Arc<dyn ConnectionInitializer> {
    Arc::new(|_conn: AcceptedConnection| -> BoxFuture<'static, ()> {
        futures_util::future::pending::<()>().boxed()
    })
}

/// Runtime for driving client-side futures from a plain test thread.
pub fn driver() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
