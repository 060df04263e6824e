//! SRP-6a Authentication
//!
//! Passcode-authenticated key exchange between a joining client and the
//! session coordinator, over the standard 2048-bit group with SHA-256. The
//! coordinator knows the passcode and derives the verifier itself from the
//! client-supplied salt, so no registration round is needed. Both sides end
//! up with the same 32-byte session key, which later seeds the per-pair mesh
//! keys.

use rand::RngCore;
use sha2::Sha256;
use srp::client::{SrpClient, SrpClientVerifier};
use srp::groups::G_2048;
use srp::server::{SrpServer, SrpServerVerifier};

use crate::constants::{SRP_EPHEMERAL_SIZE, SRP_SALT_SIZE};
use crate::error::{CryptoError, CryptoResult};

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Client half of the handshake: holds the salt and private ephemeral
/// between round one and round two.
pub struct SrpClientAuth {
    username: String,
    passcode: String,
    salt: Vec<u8>,
    a: Vec<u8>,
    client: SrpClient<'static, Sha256>,
}

impl SrpClientAuth {
    pub fn new(username: &str, passcode: &str) -> Self {
        Self {
            username: username.to_string(),
            passcode: passcode.to_string(),
            salt: random_bytes(SRP_SALT_SIZE),
            a: random_bytes(SRP_EPHEMERAL_SIZE),
            client: SrpClient::new(&G_2048),
        }
    }

    /// Salt sent in round one
    pub fn salt_hex(&self) -> String {
        hex::encode(&self.salt)
    }

    /// Public ephemeral (A) sent in round one
    pub fn public_ephemeral_hex(&self) -> String {
        hex::encode(self.client.compute_public_ephemeral(&self.a))
    }

    /// Consume the server's public ephemeral (B) and derive the session
    pub fn confirm(&self, server_ephemeral_hex: &str) -> CryptoResult<SrpClientSession> {
        let b_pub = hex::decode(server_ephemeral_hex)?;
        let verifier = self
            .client
            .process_reply(
                &self.a,
                self.username.as_bytes(),
                self.passcode.as_bytes(),
                &self.salt,
                &b_pub,
            )
            .map_err(|e| CryptoError::SrpFailure(e.to_string()))?;
        Ok(SrpClientSession { verifier })
    }
}

/// Established client session: proof to send, key to keep
pub struct SrpClientSession {
    verifier: SrpClientVerifier<Sha256>,
}

impl SrpClientSession {
    /// Session proof (M1) sent in round two
    pub fn proof_hex(&self) -> String {
        hex::encode(self.verifier.proof())
    }

    /// Shared 32-byte session key
    pub fn key(&self) -> &[u8] {
        self.verifier.key()
    }

    /// Check the server's proof (M2) from the round-two reply
    pub fn verify_server(&self, server_proof_hex: &str) -> CryptoResult<()> {
        let proof = hex::decode(server_proof_hex)?;
        self.verifier
            .verify_server(&proof)
            .map_err(|e| CryptoError::SrpFailure(e.to_string()))
    }
}

/// Server half of the handshake, one per candidate user. The verifier is
/// derived from the session passcode and the client's salt.
pub struct SrpServerAuth {
    verifier: Vec<u8>,
    b: Vec<u8>,
    server: SrpServer<'static, Sha256>,
}

impl SrpServerAuth {
    pub fn new(username: &str, passcode: &str, salt: &[u8]) -> Self {
        let client = SrpClient::<Sha256>::new(&G_2048);
        let verifier = client.compute_verifier(username.as_bytes(), passcode.as_bytes(), salt);
        Self {
            verifier,
            b: random_bytes(SRP_EPHEMERAL_SIZE),
            server: SrpServer::new(&G_2048),
        }
    }

    /// Public ephemeral (B) for the round-one reply
    pub fn public_ephemeral_hex(&self) -> String {
        hex::encode(self.server.compute_public_ephemeral(&self.b, &self.verifier))
    }

    /// Verify the client's round-two proof and derive the session
    pub fn verify(
        &self,
        client_ephemeral_hex: &str,
        client_proof_hex: &str,
    ) -> CryptoResult<SrpServerSession> {
        let a_pub = hex::decode(client_ephemeral_hex)?;
        let proof = hex::decode(client_proof_hex)?;
        let verifier = self
            .server
            .process_reply(&self.b, &self.verifier, &a_pub)
            .map_err(|e| CryptoError::SrpFailure(e.to_string()))?;
        verifier
            .verify_client(&proof)
            .map_err(|e| CryptoError::SrpFailure(e.to_string()))?;
        Ok(SrpServerSession { verifier })
    }
}

/// Established server session: key to export, proof to return
pub struct SrpServerSession {
    verifier: SrpServerVerifier<Sha256>,
}

impl SrpServerSession {
    /// Shared 32-byte session key
    pub fn key(&self) -> &[u8] {
        self.verifier.key()
    }

    /// Server proof (M2) for the round-two reply
    pub fn proof_hex(&self) -> String {
        hex::encode(self.verifier.proof())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_passcodes_agree_on_key() {
        let client = SrpClientAuth::new("frulf", "123456");
        let server = SrpServerAuth::new("frulf", "123456", &hex::decode(client.salt_hex()).unwrap());

        let session = client.confirm(&server.public_ephemeral_hex()).unwrap();
        let server_session = server
            .verify(&client.public_ephemeral_hex(), &session.proof_hex())
            .unwrap();

        assert_eq!(session.key(), server_session.key());
        assert_eq!(session.key().len(), 32);
        session.verify_server(&server_session.proof_hex()).unwrap();
    }

    #[test]
    fn test_wrong_passcode_rejected() {
        let client = SrpClientAuth::new("frulf", "654321");
        let server = SrpServerAuth::new("frulf", "123456", &hex::decode(client.salt_hex()).unwrap());

        let session = client.confirm(&server.public_ephemeral_hex()).unwrap();
        let result = server.verify(&client.public_ephemeral_hex(), &session.proof_hex());
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_hex_rejected() {
        let client = SrpClientAuth::new("frulf", "123456");
        assert!(client.confirm("not-hex").is_err());
    }
}
