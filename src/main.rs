//! transportd: runs the listeners of a transport config file.
//!
//! ```text
//!   config.toml ──→ load_config ──→ ConnectorFactory
//!                                      │
//!                  ┌───────────────────┼────────────────────┐
//!                  ▼                   ▼                    ▼
//!           ServerConnector     ServerConnector      ServerConnector
//!            (1.1, plain)        (2.0, TLS)           (3.0, QUIC)
//!                  │                   │                    │
//!                  └─────── worker thread group ────────────┘
//!                                      │
//!                        ConnectionInitializer (per channel)
//! ```
//!
//! The daemon carries no codec: accepted connections are logged and held
//! open until the peer leaves, the idle timeout fires, or shutdown closes
//! them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::io::AsyncReadExt;

use http_transport::config::load_config;
use http_transport::connector::{AcceptedConnection, ConnectionInitializer, Transport};
use http_transport::exchange::WriteCommand;
use http_transport::net::CodecEvent;
use http_transport::observability::{logging, metrics};
use http_transport::ConnectorFactory;

#[derive(Parser)]
#[command(name = "transportd")]
#[command(about = "HTTP transport daemon", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "transport.toml")]
    config: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    logging::init_logging(&config.observability.log_level);
    tracing::info!(config = %cli.config.display(), "transportd v0.1.0 starting");

    // Signal handling and the metrics exporter live on a small control runtime.
    let control = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                let _enter = control.enter();
                metrics::init_metrics(addr);
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let factory = ConnectorFactory::new(config.threads)?;
    let initializer: Arc<dyn ConnectionInitializer> = Arc::new(hold_connection);

    let mut connectors = Vec::with_capacity(config.listeners.len());
    for listener in &config.listeners {
        let connector = factory.create_server_connector(&config.bootstrap, listener)?;
        connector.start(Arc::clone(&initializer))?;
        connectors.push(connector);
    }

    if connectors.is_empty() {
        tracing::warn!("No listeners configured");
    }

    control.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to wait for shutdown signal");
        }
    });
    tracing::info!("Shutdown signal received");

    for connector in &connectors {
        connector.stop();
    }
    factory.shutdown()?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn hold_connection(connection: AcceptedConnection) -> BoxFuture<'static, ()> {
    async move {
        let AcceptedConnection {
            mut handle,
            transport,
            peer,
            bootstrap,
            ..
        } = connection;
        tracing::info!(
            connection_id = %handle.id(),
            peer = %peer,
            version = %handle.version(),
            "Connection accepted"
        );

        let cause = match transport {
            Transport::Stream(mut io) => {
                let idle = bootstrap.idle_timeout;
                let mut buf = [0u8; 4096];
                loop {
                    match tokio::time::timeout(idle, io.read(&mut buf)).await {
                        Ok(Ok(0)) => break "peer closed".to_string(),
                        Ok(Ok(n)) => tracing::trace!(connection_id = %handle.id(), bytes = n, "Discarding inbound bytes"),
                        Ok(Err(e)) => break e.to_string(),
                        Err(_) => break "idle timeout".to_string(),
                    }
                }
            }
            Transport::Quic(conn) => conn.closed().await.to_string(),
        };

        let mut sink: Vec<WriteCommand> = Vec::new();
        handle.on_codec_event(CodecEvent::ConnectionClosed { cause: cause.clone() }, Instant::now(), &mut sink);
        tracing::info!(connection_id = %handle.id(), cause = %cause, "Connection finished");
    }
    .boxed()
}
