//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::TransportConfig;
use crate::config::validation::{validate_config, ValidationError};
use crate::net::tls::TlsError;

/// Error type for configuration loading and connector setup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsError),
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{0} requires TLS configuration")]
    MissingTls(String),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<TransportConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: TransportConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_listeners_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [threads]
            acceptor = 1
            worker = 2
            client = 1
            http3 = 1

            [[listeners]]
            id = "plain"
            host = "127.0.0.1"
            port = 8080
            pipelining_enabled = true
            pipelining_limit = 3
            "#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.threads.worker, 2);
        assert_eq!(config.listeners.len(), 1);
        assert!(config.listeners[0].pipelining_enabled);
        assert_eq!(config.listeners[0].pipelining_limit, 3);
    }

    #[test]
    fn rejects_invalid_listener() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [[listeners]]
            version = "0.9"
            "#
        )
        .unwrap();

        match load_config(file.path()) {
            Err(ConfigError::Validation(errors)) => assert!(!errors.is_empty()),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/transport.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
