//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind error
    #[error("Bind error: {0}")]
    Bind(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// TLS handshake failure (bad certificate, transport error)
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// TLS configuration rejected (bad key or certificate material)
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// Channel is not connected
    #[error("Not connected")]
    NotConnected,

    /// No free port in the ephemeral range
    #[error("Could not secure a port")]
    PortExhaustion,

    /// Crypto error (from lanmesh-crypto)
    #[error("Crypto error: {0}")]
    Crypto(#[from] lanmesh_crypto::CryptoError),
}

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;
