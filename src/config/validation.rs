//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thread counts > 0, limits > 0)
//! - Check listener/sender versions and TLS requirements
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: config → Result<(), Vec<ValidationError>>
//! - Runs before any connector is built

use crate::config::schema::{
    ListenerConfig, SenderConfig, SslConfig, TransportConfig, HTTP_1_1, HTTP_2_0, HTTP_3_0,
};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub(crate) fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate the whole daemon configuration.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let threads = &config.threads;
    for (name, count) in [
        ("threads.acceptor", threads.acceptor),
        ("threads.worker", threads.worker),
        ("threads.client", threads.client),
        ("threads.http3", threads.http3),
    ] {
        if count == 0 {
            errors.push(ValidationError::new(name, "must be greater than zero"));
        }
    }

    for (i, listener) in config.listeners.iter().enumerate() {
        if let Err(listener_errors) = validate_listener(listener) {
            errors.extend(listener_errors.into_iter().map(|e| ValidationError {
                field: format!("listeners[{}].{}", i, e.field),
                message: e.message,
            }));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate one listener.
pub fn validate_listener(listener: &ListenerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if ![HTTP_1_1, HTTP_2_0, HTTP_3_0].contains(&listener.version.as_str()) {
        errors.push(ValidationError::new(
            "version",
            format!("unsupported version '{}'", listener.version),
        ));
    }
    if listener.host.is_empty() {
        errors.push(ValidationError::new("host", "must not be empty"));
    }
    if listener.max_connections == 0 {
        errors.push(ValidationError::new("max_connections", "must be greater than zero"));
    }
    if listener.pipelining_enabled && listener.pipelining_limit == 0 {
        errors.push(ValidationError::new(
            "pipelining_limit",
            "must be greater than zero when pipelining is enabled",
        ));
    }
    match &listener.ssl {
        Some(ssl) => validate_ssl("ssl", ssl, true, &mut errors),
        None if listener.version == HTTP_3_0 => {
            errors.push(ValidationError::new("ssl", "HTTP/3 listeners require TLS"));
        }
        None => {}
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate one sender.
pub fn validate_sender(sender: &SenderConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if ![HTTP_1_1, HTTP_2_0].contains(&sender.version.as_str()) {
        errors.push(ValidationError::new(
            "version",
            format!("unsupported client version '{}'", sender.version),
        ));
    }
    if sender.pool.max_idle_per_key == 0 {
        errors.push(ValidationError::new(
            "pool.max_idle_per_key",
            "must be greater than zero",
        ));
    }
    if let Some(ssl) = &sender.ssl {
        validate_ssl("ssl", ssl, false, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_ssl(prefix: &str, ssl: &SslConfig, server: bool, errors: &mut Vec<ValidationError>) {
    let has_pair = ssl.certificate_file.is_some() && ssl.private_key_file.is_some();
    if server && ssl.key_store.is_none() && !has_pair {
        errors.push(ValidationError::new(
            prefix,
            "a key_store or both certificate_file and private_key_file are required",
        ));
    }
    if ssl.certificate_file.is_some() != ssl.private_key_file.is_some() {
        errors.push(ValidationError::new(
            prefix,
            "certificate_file and private_key_file must be given together",
        ));
    }
    if ssl.validate_cert && ssl.revocation_lists.is_empty() {
        errors.push(ValidationError::new(
            format!("{}.revocation_lists", prefix),
            "revocation checking requires at least one CRL",
        ));
    }
    if ssl.ocsp_stapling && server && ssl.ocsp_response_file.is_none() {
        errors.push(ValidationError::new(
            format!("{}.ocsp_response_file", prefix),
            "OCSP stapling requires a response file",
        ));
    }
    if ssl.session_cache_size == 0 {
        errors.push(ValidationError::new(
            format!("{}.session_cache_size", prefix),
            "must be greater than zero",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::KeyStoreConfig;

    #[test]
    fn default_listener_is_valid() {
        assert!(validate_listener(&ListenerConfig::default()).is_ok());
    }

    #[test]
    fn http3_without_tls_is_rejected() {
        let listener = ListenerConfig {
            version: HTTP_3_0.into(),
            ..Default::default()
        };
        let errors = validate_listener(&listener).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "ssl");
    }

    #[test]
    fn collects_every_error() {
        let listener = ListenerConfig {
            version: "0.9".into(),
            host: String::new(),
            pipelining_enabled: true,
            pipelining_limit: 0,
            ..Default::default()
        };
        let errors = validate_listener(&listener).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn keystore_alone_satisfies_server_tls() {
        let listener = ListenerConfig {
            version: HTTP_2_0.into(),
            ssl: Some(SslConfig {
                key_store: Some(KeyStoreConfig {
                    path: "bundle.pem".into(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(validate_listener(&listener).is_ok());
    }

    #[test]
    fn revocation_without_crl_is_rejected() {
        let sender = SenderConfig {
            ssl: Some(SslConfig {
                validate_cert: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let errors = validate_sender(&sender).unwrap_err();
        assert_eq!(errors[0].field, "ssl.revocation_lists");
    }

    #[test]
    fn zero_threads_are_reported_with_path() {
        let mut config = TransportConfig::default();
        config.threads.worker = 0;
        config.listeners.push(ListenerConfig {
            version: "4.0".into(),
            ..Default::default()
        });
        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["threads.worker", "listeners[0].version"]);
    }
}
