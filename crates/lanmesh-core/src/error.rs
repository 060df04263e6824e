//! Session error types
//!
//! Errors cross component boundaries as events; these types surface at the
//! façade API (`create`, `connect_session`, `start_mesh`) and inside error
//! events.

use lanmesh_crypto::CryptoError;
use lanmesh_network::NetError;
use thiserror::Error;

/// Errors surfaced by the session core
#[derive(Debug, Error)]
pub enum SessionError {
    /// Pass-through from the discovery collaborator
    #[error("Discovery: {0}")]
    Discovery(String),

    /// Coordinator rejected the handshake (collision, IP mismatch, retry
    /// budget, SRP failure). Carries the coordinator's message verbatim.
    #[error("{0}")]
    CoordinatorAuth(String),

    /// TLS or transport failure
    #[error("TLS error: {0}")]
    Tls(NetError),

    /// AES encrypt/decrypt failure while handling a mesh message
    #[error("Encryption failure in {fn_name} for '{username}' ({message_type})")]
    NodeEncrypt {
        fn_name: &'static str,
        username: String,
        message_type: String,
    },

    /// No free port in the ephemeral range; fatal at construction
    #[error("Could not secure a port")]
    PortExhaustion,

    /// Key generation or certificate failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Malformed or unexpected protocol traffic
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<NetError> for SessionError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::PortExhaustion => SessionError::PortExhaustion,
            other => SessionError::Tls(other),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Protocol(e.to_string())
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
