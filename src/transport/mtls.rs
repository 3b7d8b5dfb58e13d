//! mTLS configuration for the agent's gRPC listener
//!
//! # Security Model
//!
//! - The agent presents its leaf certificate and requires one from every client
//! - Clients must chain to the trust bundle's root; anything else fails the
//!   handshake before a request is read
//! - Protocol versions start at the configured minimum (TLS 1.3 by default)
//! - Only AEAD suites with 256-bit AES-GCM or ChaCha20-Poly1305 are offered
//!
//! Trust material is parsed once into a [`TrustBundle`] and then shared by
//! every server configuration built from it.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, SupportedProtocolVersion};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};
use x509_parser::prelude::*;

/// mTLS configuration errors
#[derive(Debug, Error)]
pub enum MtlsError {
    /// A PEM file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that could not be read
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    CertificateParseError(String),

    /// Key parsing error
    #[error("key parsing error: {0}")]
    KeyParseError(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfigError(String),

    /// Missing certificate
    #[error("missing certificate")]
    MissingCertificate,

    /// Unknown minimum protocol version
    #[error("unsupported TLS version {0:?}, expected TLS1.2 or TLS1.3")]
    UnsupportedVersion(String),
}

/// Lowest protocol version the listener accepts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    #[serde(rename = "TLS1.2")]
    Tls12,
    /// TLS 1.3 only
    #[default]
    #[serde(rename = "TLS1.3")]
    Tls13,
}

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

impl TlsVersion {
    fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls12 => rustls::ALL_VERSIONS,
            TlsVersion::Tls13 => TLS13_ONLY,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = MtlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLS1.3" => Ok(TlsVersion::Tls13),
            other => Err(MtlsError::UnsupportedVersion(other.to_string())),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::Tls12 => write!(f, "TLS1.2"),
            TlsVersion::Tls13 => write!(f, "TLS1.3"),
        }
    }
}

/// aws-lc-rs provider restricted to the two AEAD constructions we allow
///
/// TLS 1.2 gets the ECDHE-ECDSA variants of the same two ciphers; the
/// bootstrap leaf is a P-256 key so ECDSA is the only signature needed.
pub fn restricted_provider(min_version: TlsVersion) -> CryptoProvider {
    use aws_lc_rs::cipher_suite;

    let mut provider = aws_lc_rs::default_provider();
    let mut suites = vec![
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    ];
    if min_version == TlsVersion::Tls12 {
        suites.extend([
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        ]);
    }
    provider.cipher_suites = suites;
    provider
}

/// Leaf identity plus the roots trusted for client certificates
pub struct TrustBundle {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: Arc<RootCertStore>,
    leaf_name: Option<String>,
}

impl TrustBundle {
    /// Parse PEM-encoded leaf chain, leaf key, and CA bundle
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> Result<Self, MtlsError> {
        let chain = CertificateDer::pem_slice_iter(cert_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MtlsError::CertificateParseError(format!("server certificate: {}", e)))?;
        if chain.is_empty() {
            return Err(MtlsError::MissingCertificate);
        }

        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|e| MtlsError::KeyParseError(e.to_string()))?;

        let ca_certs = CertificateDer::pem_slice_iter(ca_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MtlsError::CertificateParseError(format!("CA certificate: {}", e)))?;
        if ca_certs.is_empty() {
            return Err(MtlsError::MissingCertificate);
        }

        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| MtlsError::CertificateParseError(format!("CA certificate: {}", e)))?;
        }

        let leaf_name = common_name(&chain[0])?;

        Ok(Self {
            chain,
            key,
            roots: Arc::new(roots),
            leaf_name,
        })
    }

    /// Read and parse the three PEM files once
    pub fn load(
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
        ca_file: impl AsRef<Path>,
    ) -> Result<Self, MtlsError> {
        let cert = read(cert_file.as_ref())?;
        let key = read(key_file.as_ref())?;
        let ca = read(ca_file.as_ref())?;
        Self::from_pem(&cert, &key, &ca)
    }

    /// Common name of the leaf, if it has one
    pub fn leaf_common_name(&self) -> Option<&str> {
        self.leaf_name.as_deref()
    }

    /// Server configuration requiring client certificates from the bundle's roots
    pub fn server_config(&self, min_version: TlsVersion) -> Result<Arc<ServerConfig>, MtlsError> {
        let provider = Arc::new(restricted_provider(min_version));

        let verifier =
            WebPkiClientVerifier::builder_with_provider(self.roots.clone(), provider.clone())
                .build()
                .map_err(|e| MtlsError::TlsConfigError(format!("client verifier: {}", e)))?;

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(min_version.protocol_versions())
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| MtlsError::TlsConfigError(format!("server certificate: {}", e)))?;

        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(Arc::new(config))
    }
}

impl fmt::Debug for TrustBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustBundle")
            .field("chain_len", &self.chain.len())
            .field("roots", &self.roots.len())
            .field("leaf", &self.leaf_common_name())
            .finish_non_exhaustive()
    }
}

/// Client-side mTLS configuration for talking to an agent
pub struct ClientMtlsConfig {
    /// Client certificate PEM
    pub client_cert_pem: String,
    /// Client private key PEM
    pub client_key_pem: String,
    /// CA certificate PEM for verifying the agent
    pub ca_cert_pem: String,
    /// Name the agent's certificate must carry
    pub server_domain: String,
}

impl ClientMtlsConfig {
    /// Create a new client mTLS config
    pub fn new(
        client_cert_pem: String,
        client_key_pem: String,
        ca_cert_pem: String,
        server_domain: String,
    ) -> Self {
        Self {
            client_cert_pem,
            client_key_pem,
            ca_cert_pem,
            server_domain,
        }
    }

    /// Build a tonic ClientTlsConfig
    pub fn to_tonic_config(&self) -> ClientTlsConfig {
        let identity = Identity::from_pem(&self.client_cert_pem, &self.client_key_pem);
        let ca_cert = Certificate::from_pem(&self.ca_cert_pem);

        ClientTlsConfig::new()
            .identity(identity)
            .ca_certificate(ca_cert)
            .domain_name(&self.server_domain)
    }
}

/// Common name of a DER certificate
pub fn common_name(cert_der: &[u8]) -> Result<Option<String>, MtlsError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| MtlsError::CertificateParseError(format!("failed to parse cert: {}", e)))?;

    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    Ok(name)
}

fn read(path: &Path) -> Result<Vec<u8>, MtlsError> {
    std::fs::read(path).map_err(|source| MtlsError::Read {
        path: path.display().to_string(),
        source,
    })
}
