//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length provided
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid IV length
    #[error("Invalid IV length: expected {expected}, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (bad padding or corrupted data)
    #[error("Decryption failed: padding or integrity check failed")]
    DecryptionFailed,

    /// RSA key generation failed
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate construction failed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// SRP handshake failure (bad proof, bad ephemeral, wrong passcode)
    #[error("SRP failure: {0}")]
    SrpFailure(String),

    /// Malformed hex or base64 input
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl From<hex::FromHexError> for CryptoError {
    fn from(e: hex::FromHexError) -> Self {
        CryptoError::Encoding(e.to_string())
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
