//! Factory shutdown with live channels.

mod common;

use std::net::TcpStream;
use std::time::Duration;

use common::{holding_initializer, loopback_listener, small_factory, wait_until};
use http_transport::config::ServerBootstrapConfig;
use http_transport::{ShutdownError, TransportError};

#[test]
fn shutdown_twice_closes_every_channel() {
    let factory = small_factory();
    let connector = factory
        .create_server_connector(&ServerBootstrapConfig::default(), &loopback_listener("plain", "1.1"))
        .unwrap();
    let addr = connector.start(holding_initializer()).unwrap();

    let _first = TcpStream::connect(addr).unwrap();
    let _second = TcpStream::connect(addr).unwrap();
    let channels = factory.groups().channels().clone();
    assert!(wait_until(Duration::from_secs(2), || channels.len() == 2));

    factory.shutdown().unwrap();
    assert_eq!(channels.len(), 0);
    assert!(factory.groups().is_shut_down());

    factory.shutdown().unwrap();
    assert_eq!(channels.len(), 0);
}

#[test]
fn stopped_listener_accepts_nothing_new() {
    let factory = small_factory();
    let connector = factory
        .create_server_connector(&ServerBootstrapConfig::default(), &loopback_listener("stopping", "1.1"))
        .unwrap();
    let addr = connector.start(holding_initializer()).unwrap();

    let _held = TcpStream::connect(addr).unwrap();
    let channels = factory.groups().channels().clone();
    assert!(wait_until(Duration::from_secs(2), || channels.len() == 1));

    connector.stop();
    std::thread::sleep(Duration::from_millis(50));
    let _late = TcpStream::connect(addr);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(channels.len(), 1);

    factory.shutdown().unwrap();
}

#[test]
fn starting_twice_is_an_error() {
    let factory = small_factory();
    let connector = factory
        .create_server_connector(&ServerBootstrapConfig::default(), &loopback_listener("twice", "1.1"))
        .unwrap();
    connector.start(holding_initializer()).unwrap();
    assert!(connector.start(holding_initializer()).is_err());
    factory.shutdown().unwrap();
}

#[tokio::test]
async fn shutdown_from_async_context_is_interrupted() {
    let factory = small_factory();
    let err = factory.shutdown().unwrap_err();
    assert!(matches!(err, TransportError::Shutdown(ShutdownError::Interrupted(_))));
}
