//! Symmetric Encryption (AES-256-CBC)
//!
//! Per-message encryption for mesh traffic and the coordinator's round-two
//! payload. Every message uses a fresh random 16-byte IV; plaintexts are
//! PKCS#7-padded.

use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{IV_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// A 256-bit symmetric key
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

/// A 128-bit CBC initialization vector
#[derive(Debug, Clone, Copy)]
pub struct Iv {
    bytes: [u8; IV_SIZE],
}

impl SymmetricKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SYMMETRIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SYMMETRIC_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s)?;
        Self::try_from_slice(&bytes)
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Hex form for the roster wire format
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

impl Iv {
    /// Create an IV from raw bytes
    pub fn from_bytes(bytes: [u8; IV_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != IV_SIZE {
            return Err(CryptoError::InvalidIvLength {
                expected: IV_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; IV_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Generate a random IV
    pub fn generate() -> Self {
        let mut bytes = [0u8; IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.bytes
    }
}

/// Encrypt plaintext with AES-256-CBC / PKCS#7
pub fn encrypt(key: &SymmetricKey, iv: &Iv, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256CbcEnc::new_from_slices(&key.bytes, &iv.bytes)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt AES-256-CBC / PKCS#7 ciphertext
pub fn decrypt(key: &SymmetricKey, iv: &Iv, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256CbcDec::new_from_slices(&key.bytes, &iv.bytes)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = SymmetricKey::generate();
        let iv = Iv::generate();
        let plaintext = b"Hello, lanmesh!";

        let ciphertext = encrypt(&key, &iv, plaintext).unwrap();
        assert_ne!(ciphertext.as_slice(), plaintext);
        // CBC pads up to the next block boundary
        assert_eq!(ciphertext.len() % 16, 0);

        let decrypted = decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = SymmetricKey::generate();
        let key2 = SymmetricKey::generate();
        let iv = Iv::generate();

        let ciphertext = encrypt(&key1, &iv, b"Test message").unwrap();
        assert!(decrypt(&key2, &iv, &ciphertext).is_err());
    }

    #[test]
    fn test_hex_round_trip() {
        let key = SymmetricKey::generate();
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(SymmetricKey::from_hex(&hex).unwrap(), key);
    }

    #[test]
    fn test_bad_lengths_rejected() {
        assert!(SymmetricKey::try_from_slice(&[0u8; 16]).is_err());
        assert!(Iv::try_from_slice(&[0u8; 12]).is_err());
        assert!(SymmetricKey::from_hex("abcd").is_err());
    }
}
