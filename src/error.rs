//! Error types for the agent

use thiserror::Error;

use crate::config::ConfigError;
use crate::pki::PkiError;
use crate::transport::mtls::MtlsError;
use crate::transport::TransportError;

/// Main error type for agent operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration could not be loaded or failed validation
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Certificate bootstrap or verification failed
    #[error("PKI error: {0}")]
    Pki(#[from] PkiError),

    /// TLS material could not be turned into a server configuration
    #[error("mTLS error: {0}")]
    Mtls(#[from] MtlsError),

    /// The RPC transport failed to bind or serve
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
