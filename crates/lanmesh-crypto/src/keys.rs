//! RSA Keypair Generation
//!
//! Every session owns two RSA-2048 keypairs, one for the coordinator
//! certificate and one for the node certificate. Generation is CPU-heavy, so
//! it is issued on a blocking worker and surfaced as a future.

use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::RSA_KEY_BITS;
use crate::error::{CryptoError, CryptoResult};

/// An RSA private key held as PKCS#8 DER, ready to back a TLS endpoint
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RsaKeyMaterial {
    pkcs8_der: Vec<u8>,
}

impl RsaKeyMaterial {
    /// Wrap an existing PKCS#8 DER blob
    pub fn from_pkcs8_der(pkcs8_der: Vec<u8>) -> Self {
        Self { pkcs8_der }
    }

    /// The PKCS#8 DER bytes
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_der
    }
}

impl std::fmt::Debug for RsaKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RsaKeyMaterial(..)")
    }
}

/// Generate a fresh RSA-2048 keypair on a blocking worker
pub async fn generate_rsa_key() -> CryptoResult<RsaKeyMaterial> {
    tokio::task::spawn_blocking(|| {
        let mut rng = rand::rngs::OsRng;
        let key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let der = key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(RsaKeyMaterial {
            pkcs8_der: der.as_bytes().to_vec(),
        })
    })
    .await
    .map_err(|e| CryptoError::KeyGeneration(format!("worker task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_rsa_key() {
        let key = generate_rsa_key().await.unwrap();
        // PKCS#8-wrapped RSA-2048 private keys run north of a kilobyte
        assert!(key.pkcs8_der().len() > 1000);
    }
}
