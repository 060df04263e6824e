//! Lanmesh Cryptographic Glue
//!
//! This crate provides the cryptographic operations for the lanmesh session
//! protocol:
//! - Symmetric encryption (AES-256-CBC with PKCS#7 padding)
//! - RSA-2048 keypair generation for TLS certificates
//! - Self-signed X.509 certificates with pinned common names
//! - SRP-6a client and server authentication (2048-bit group, SHA-256)
//! - Passcode and mnemonic identifier generation

pub mod cert;
pub mod error;
pub mod keys;
pub mod passcode;
pub mod srp;
pub mod symmetric;

pub use cert::self_signed_cert_der;
pub use error::CryptoError;
pub use keys::{generate_rsa_key, RsaKeyMaterial};
pub use passcode::{generate_passcode, mnemonic};
pub use srp::{SrpClientAuth, SrpClientSession, SrpServerAuth, SrpServerSession};
pub use symmetric::{decrypt, encrypt, Iv, SymmetricKey};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cert::*;
    pub use crate::error::*;
    pub use crate::keys::*;
    pub use crate::passcode::*;
    pub use crate::srp::*;
    pub use crate::symmetric::*;
}

/// Protocol constants
pub mod constants {
    /// AES-256 key size in bytes
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// AES-CBC initialization vector size
    pub const IV_SIZE: usize = 16;

    /// RSA modulus size for certificate keys
    pub const RSA_KEY_BITS: usize = 2048;

    /// X.509 serial number length in bytes
    pub const CERT_SERIAL_SIZE: usize = 20;

    /// SRP salt length in bytes
    pub const SRP_SALT_SIZE: usize = 16;

    /// SRP private ephemeral length in bytes
    pub const SRP_EPHEMERAL_SIZE: usize = 64;

    /// Heartbeat challenge length in bytes
    pub const CHALLENGE_SIZE: usize = 16;
}
