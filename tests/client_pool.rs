//! Client connectors reuse pooled connections.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{driver, holding_initializer, loopback_listener, small_factory, wait_until};
use http_transport::config::{PoolConfig, SenderConfig, ServerBootstrapConfig, TransportProperties};
use http_transport::connector::ClientPool;

#[test]
fn released_connection_is_leased_again() {
    let factory = small_factory();
    let server = factory
        .create_server_connector(&ServerBootstrapConfig::default(), &loopback_listener("backend", "1.1"))
        .unwrap();
    let addr = server.start(holding_initializer()).unwrap();
    let authority = addr.to_string();

    let client = factory
        .create_client_connector(&TransportProperties::new(), &SenderConfig::default())
        .unwrap();

    let rt = driver();
    rt.block_on(async {
        let first = client.connect(&authority).await.unwrap();
        let first_id = first.handle().id();
        assert!(client.release(first));
        assert_eq!(client.pool().idle_count(&client.key(&authority)), 1);

        let again = client.connect(&authority).await.unwrap();
        assert_eq!(again.handle().id(), first_id);
        assert_eq!(client.pool().idle_count(&client.key(&authority)), 0);

        // Nothing idle and `again` still out: waits the max wait, then dials.
        let other = client.connect(&authority).await.unwrap();
        assert_ne!(other.handle().id(), first_id);
    });
    drop(rt);

    let channels = factory.groups().channels().clone();
    assert!(wait_until(Duration::from_secs(2), || channels.len() == 2));
    factory.shutdown().unwrap();
}

#[test]
fn shared_pool_separates_sender_fingerprints() {
    let factory = small_factory();
    let server = factory
        .create_server_connector(&ServerBootstrapConfig::default(), &loopback_listener("shared", "1.1"))
        .unwrap();
    let authority = server.start(holding_initializer()).unwrap().to_string();

    let pool = Arc::new(ClientPool::new(&PoolConfig::default()));
    let fast = factory
        .create_client_connector_with_pool(&TransportProperties::new(), &SenderConfig::default(), Arc::clone(&pool))
        .unwrap();
    let slow_sender = SenderConfig {
        socket_idle_timeout_secs: 5,
        ..SenderConfig::default()
    };
    let slow = factory
        .create_client_connector_with_pool(&TransportProperties::new(), &slow_sender, Arc::clone(&pool))
        .unwrap();
    assert_ne!(fast.key(&authority), slow.key(&authority));

    let rt = driver();
    rt.block_on(async {
        let conn = fast.connect(&authority).await.unwrap();
        let id = conn.handle().id();
        assert!(fast.release(conn));

        let other = slow.connect(&authority).await.unwrap();
        assert_ne!(other.handle().id(), id);
        assert_eq!(pool.total_idle(), 1);
    });
    drop(rt);

    factory.shutdown().unwrap();
}

#[test]
fn cold_connect_dials_without_waiting_for_the_pool() {
    let factory = small_factory();
    let server = factory
        .create_server_connector(&ServerBootstrapConfig::default(), &loopback_listener("cold", "1.1"))
        .unwrap();
    let authority = server.start(holding_initializer()).unwrap().to_string();

    let sender = SenderConfig {
        pool: PoolConfig {
            max_wait_ms: 1_500,
            ..PoolConfig::default()
        },
        ..SenderConfig::default()
    };
    let client = factory
        .create_client_connector(&TransportProperties::new(), &sender)
        .unwrap();

    let rt = driver();
    rt.block_on(async {
        let start = Instant::now();
        let conn = client.connect(&authority).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(500), "cold connect took {:?}", start.elapsed());
        assert_eq!(client.pool().checked_out(&client.key(&authority)), 1);

        drop(conn);
        assert_eq!(client.pool().checked_out(&client.key(&authority)), 0);
        let start = Instant::now();
        client.connect(&authority).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
    });
    drop(rt);

    factory.shutdown().unwrap();
}
