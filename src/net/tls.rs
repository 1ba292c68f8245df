//! TLS context construction.
//!
//! # Responsibilities
//! - Load credentials from a keystore bundle or a certificate/key pair
//! - Build one immutable context per listener or sender configuration
//! - Advertise exactly the application protocols of the requested version
//! - Apply revocation lists, OCSP stapling and session caching
//!
//! # Design Decisions
//! - Both credential sources converge on [`CertifiedMaterial`] before any
//!   rustls builder is touched, so every option applies to both paths
//! - Failures are returned as [`TlsError`]; a listener never falls back to
//!   plaintext
//! - The crypto provider is chosen explicitly rather than relying on a
//!   process-wide default

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicServerConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{Resumption, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName, UnixTime,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use crate::config::{ClientAuth, SslConfig};
use crate::net::connection::HttpVersion;
use crate::net::session::ExpiringSessionCache;

pub const ALPN_HTTP_1_1: &[u8] = b"http/1.1";
pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_H3: &[u8] = b"h3";

/// Error raised while building a TLS context.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("no credentials configured (key_store or certificate_file/private_key_file)")]
    MissingCredentials,
    #[error("no trusted certificates configured")]
    MissingTrustStore,
    #[error("OCSP stapling enabled without an OCSP response")]
    MissingOcspResponse,
    #[error("revocation checking enabled without revocation lists")]
    MissingRevocationLists,
    #[error("certificate verifier: {0}")]
    Verifier(String),
    #[error("QUIC crypto: {0}")]
    Quic(String),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Certificate chain and private key, independent of where they came from.
#[derive(Debug)]
pub struct CertifiedMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl CertifiedMaterial {
    /// Load from a PEM bundle holding both the chain and the key.
    pub fn from_key_store(path: &str) -> Result<Self, TlsError> {
        let data = read_file(path)?;
        let certs = parse_certs(path, &data)?;
        let key = parse_key(path, &data)?;
        Ok(Self { certs, key })
    }

    /// Load from separate certificate and key files.
    pub fn from_pem_files(cert_path: &str, key_path: &str) -> Result<Self, TlsError> {
        let certs = parse_certs(cert_path, &read_file(cert_path)?)?;
        let key = parse_key(key_path, &read_file(key_path)?)?;
        Ok(Self { certs, key })
    }

    /// Resolve the credentials named in `ssl`; the keystore wins when both are set.
    pub fn from_config(ssl: &SslConfig) -> Result<Option<Self>, TlsError> {
        if let Some(store) = &ssl.key_store {
            return Self::from_key_store(&store.path).map(Some);
        }
        match (&ssl.certificate_file, &ssl.private_key_file) {
            (Some(cert), Some(key)) => Self::from_pem_files(cert, key).map(Some),
            _ => Ok(None),
        }
    }
}

/// Settings applied to a context regardless of credential source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub ocsp_stapling: bool,
    pub revocation_check: bool,
    pub session_cache_size: usize,
    pub session_timeout: Duration,
}

impl TlsSettings {
    fn from_config(ssl: &SslConfig) -> Self {
        Self {
            ocsp_stapling: ssl.ocsp_stapling,
            revocation_check: ssl.validate_cert,
            session_cache_size: ssl.session_cache_size,
            session_timeout: Duration::from_secs(ssl.session_timeout_secs),
        }
    }
}

/// The rustls/quinn configuration a connection attaches to.
#[derive(Clone)]
pub enum TlsContextKind {
    Server(Arc<ServerConfig>),
    Quic(Arc<QuicServerConfig>),
    Client(Arc<ClientConfig>),
}

/// Immutable secure-transport context shared by every connection of a connector.
#[derive(Clone)]
pub struct TlsContext {
    kind: TlsContextKind,
    version: HttpVersion,
    alpn: Vec<Vec<u8>>,
    settings: TlsSettings,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TlsContextKind::Server(_) => "server",
            TlsContextKind::Quic(_) => "quic",
            TlsContextKind::Client(_) => "client",
        };
        f.debug_struct("TlsContext")
            .field("kind", &kind)
            .field("version", &self.version)
            .field("alpn", &alpn_names(&self.alpn))
            .field("settings", &self.settings)
            .finish()
    }
}

impl TlsContext {
    pub fn kind(&self) -> &TlsContextKind {
        &self.kind
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// Protocols advertised during negotiation, in preference order.
    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn
    }

    pub fn advertises(&self, protocol: &[u8]) -> bool {
        self.alpn.iter().any(|p| p.as_slice() == protocol)
    }

    pub fn settings(&self) -> &TlsSettings {
        &self.settings
    }

    /// rustls server configuration for TCP listeners.
    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        match &self.kind {
            TlsContextKind::Server(c) => Some(Arc::clone(c)),
            _ => None,
        }
    }

    /// QUIC crypto configuration for HTTP/3 listeners.
    pub fn quic_config(&self) -> Option<Arc<QuicServerConfig>> {
        match &self.kind {
            TlsContextKind::Quic(c) => Some(Arc::clone(c)),
            _ => None,
        }
    }

    /// rustls client configuration for outbound connections.
    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        match &self.kind {
            TlsContextKind::Client(c) => Some(Arc::clone(c)),
            _ => None,
        }
    }
}

/// ALPN list appropriate to a version.
pub fn alpn_for(version: HttpVersion, http2_fallback: bool) -> Vec<Vec<u8>> {
    match version {
        HttpVersion::Http11 => vec![ALPN_HTTP_1_1.to_vec()],
        HttpVersion::Http2 if http2_fallback => vec![ALPN_H2.to_vec(), ALPN_HTTP_1_1.to_vec()],
        HttpVersion::Http2 => vec![ALPN_H2.to_vec()],
        HttpVersion::Http3 => vec![ALPN_H3.to_vec()],
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the server context of a listener.
pub fn build_server_context(ssl: &SslConfig, version: HttpVersion) -> Result<TlsContext, TlsError> {
    let material = CertifiedMaterial::from_config(ssl)?.ok_or(TlsError::MissingCredentials)?;
    build_server_context_from(material, ssl, version)
}

/// Build a server context from already loaded credentials.
pub fn build_server_context_from(
    material: CertifiedMaterial,
    ssl: &SslConfig,
    version: HttpVersion,
) -> Result<TlsContext, TlsError> {
    let provider = provider();
    let versions: &[&'static rustls::SupportedProtocolVersion] = match version {
        HttpVersion::Http3 => &[&rustls::version::TLS13],
        _ => rustls::DEFAULT_VERSIONS,
    };

    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(versions)?;

    let builder = match client_verifier(ssl, &provider)? {
        Some(verifier) => builder.with_client_cert_verifier(verifier),
        None => builder.with_no_client_auth(),
    };

    let mut config = if ssl.ocsp_stapling {
        let path = ssl
            .ocsp_response_file
            .as_deref()
            .ok_or(TlsError::MissingOcspResponse)?;
        let ocsp = read_file(path)?;
        builder.with_single_cert_with_ocsp(material.certs, material.key, ocsp)?
    } else {
        builder.with_single_cert(material.certs, material.key)?
    };

    let alpn = alpn_for(version, ssl.http2_fallback_enabled);
    config.alpn_protocols = alpn.clone();
    config.session_storage = Arc::new(ExpiringSessionCache::new(
        ssl.session_cache_size,
        Duration::from_secs(ssl.session_timeout_secs),
    ));

    let kind = match version {
        HttpVersion::Http3 => {
            let quic = QuicServerConfig::try_from(config).map_err(|e| TlsError::Quic(e.to_string()))?;
            TlsContextKind::Quic(Arc::new(quic))
        }
        _ => TlsContextKind::Server(Arc::new(config)),
    };

    tracing::debug!(
        version = %version,
        alpn = ?alpn_names(&alpn),
        client_auth = ?ssl.client_auth,
        ocsp_stapling = ssl.ocsp_stapling,
        revocation_check = ssl.validate_cert,
        "Server TLS context built"
    );

    Ok(TlsContext {
        kind,
        version,
        alpn,
        settings: TlsSettings::from_config(ssl),
    })
}

/// Build the client context of a sender.
pub fn build_client_context(ssl: &SslConfig, version: HttpVersion) -> Result<TlsContext, TlsError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)?;

    let builder = if ssl.disable_verification {
        tracing::warn!("Server certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(Arc::clone(&provider))))
    } else {
        let path = ssl
            .trust_certificates_file
            .as_deref()
            .ok_or(TlsError::MissingTrustStore)?;
        let roots = load_roots(path)?;
        let mut verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider));
        if ssl.validate_cert {
            verifier = verifier.with_crls(load_crls(ssl)?);
        }
        let verifier = verifier
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
        builder.with_webpki_verifier(verifier)
    };

    let mut config = match CertifiedMaterial::from_config(ssl)? {
        Some(material) => builder.with_client_auth_cert(material.certs, material.key)?,
        None => builder.with_no_client_auth(),
    };

    let alpn = alpn_for(version, ssl.http2_fallback_enabled);
    config.alpn_protocols = alpn.clone();
    config.resumption = Resumption::in_memory_sessions(ssl.session_cache_size);

    tracing::debug!(version = %version, alpn = ?alpn_names(&alpn), "Client TLS context built");

    Ok(TlsContext {
        kind: TlsContextKind::Client(Arc::new(config)),
        version,
        alpn,
        settings: TlsSettings::from_config(ssl),
    })
}

fn client_verifier(
    ssl: &SslConfig,
    provider: &Arc<CryptoProvider>,
) -> Result<Option<Arc<dyn rustls::server::danger::ClientCertVerifier>>, TlsError> {
    if ssl.client_auth == ClientAuth::None {
        return Ok(None);
    }
    let path = ssl
        .trust_certificates_file
        .as_deref()
        .ok_or(TlsError::MissingTrustStore)?;
    let roots = load_roots(path)?;

    let mut builder = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider));
    if ssl.validate_cert {
        builder = builder.with_crls(load_crls(ssl)?);
    }
    if ssl.client_auth == ClientAuth::Optional {
        builder = builder.allow_unauthenticated();
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| TlsError::Verifier(e.to_string()))
}

fn load_roots(path: &str) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(path, &read_file(path)?)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn load_crls(ssl: &SslConfig) -> Result<Vec<CertificateRevocationListDer<'static>>, TlsError> {
    if ssl.revocation_lists.is_empty() {
        return Err(TlsError::MissingRevocationLists);
    }
    let mut crls = Vec::new();
    for path in &ssl.revocation_lists {
        let data = read_file(path)?;
        let mut reader: &[u8] = &data;
        for crl in rustls_pemfile::crls(&mut reader) {
            crls.push(crl.map_err(|source| TlsError::Read {
                path: path.clone(),
                source,
            })?);
        }
    }
    Ok(crls)
}

fn read_file(path: &str) -> Result<Vec<u8>, TlsError> {
    let mut data = Vec::new();
    File::open(Path::new(path))
        .map(BufReader::new)
        .and_then(|mut r| r.read_to_end(&mut data))
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })?;
    Ok(data)
}

fn parse_certs(path: &str, data: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = data;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }
    Ok(certs)
}

fn parse_key(path: &str, data: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = data;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_string()))
}

fn alpn_names(alpn: &[Vec<u8>]) -> Vec<String> {
    alpn.iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}

/// Accepts any server certificate. Only reachable via `disable_verification`.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
