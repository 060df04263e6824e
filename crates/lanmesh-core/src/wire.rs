//! Wire Protocol
//!
//! UTF-8 JSON messages delivered as TLS application data. Field names are
//! pinned to the legacy protocol, including the `serverEphermalKey`
//! spelling. Encrypted payloads are AES-CBC over the base64 of the
//! plaintext, then base64 again on the wire.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use lanmesh_crypto::{decrypt, encrypt, CryptoError, Iv, SymmetricKey};

/// Messages from a joining client to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoordinatorRequest {
    #[serde(rename = "srp-handshake_1")]
    HandshakeOne(HandshakeOneRequest),
    #[serde(rename = "srp-handshake_2")]
    HandshakeTwo(HandshakeTwoRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeOneRequest {
    pub username: String,
    pub salt: String,
    #[serde(rename = "clientEphemeralPublic")]
    pub client_ephemeral_public: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeTwoRequest {
    #[serde(rename = "sessionProof")]
    pub session_proof: String,
    pub username: String,
    #[serde(rename = "nodePort")]
    pub node_port: u16,
}

/// Reply status on every coordinator reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// Replies from the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoordinatorReply {
    #[serde(rename = "srp-handshake_1")]
    HandshakeOne {
        payload: Option<HandshakeOneReply>,
        status: ReplyStatus,
        error: Option<String>,
    },
    #[serde(rename = "srp-handshake_2")]
    HandshakeTwo {
        payload: Option<HandshakeTwoReply>,
        status: ReplyStatus,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeOneReply {
    // legacy spelling, load-bearing for interop
    #[serde(rename = "serverEphermalKey")]
    pub server_ephemeral_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeTwoReply {
    pub iv: String,
    pub encrypted: String,
    #[serde(rename = "serverProof")]
    pub server_proof: String,
}

/// Decrypted round-two payload: where to find the host's node listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndpoint {
    #[serde(rename = "userName")]
    pub user_name: String,
    pub ip: String,
    pub port: u16,
}

/// Mesh message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    Hello,
    AckHello,
    Message,
    Broadcast,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Hello => "hello",
            EnvelopeKind::AckHello => "ack-hello",
            EnvelopeKind::Message => "message",
            EnvelopeKind::Broadcast => "broadcast",
        }
    }
}

/// Envelope for all node-to-node traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(rename = "encryptedMessage")]
    pub encrypted_message: String,
    pub iv: String,
    pub from: String,
}

impl NodeEnvelope {
    /// Encrypt `plaintext` under `key` with a fresh IV
    pub fn seal(
        kind: EnvelopeKind,
        from: &str,
        key: &SymmetricKey,
        plaintext: &[u8],
    ) -> Result<Self, CryptoError> {
        let (iv, encrypted_message) = seal_bytes(key, plaintext)?;
        Ok(Self {
            kind,
            encrypted_message,
            iv,
            from: from.to_string(),
        })
    }

    /// Decrypt the carried payload
    pub fn open(&self, key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
        open_bytes(key, &self.iv, &self.encrypted_message)
    }
}

/// Decrypted `hello` payload: the membership roster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterPayload {
    pub nodes: Vec<RosterEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub username: String,
    pub ip: String,
    pub port: u16,
    #[serde(rename = "sendKey")]
    pub send_key: String,
    #[serde(rename = "receiveKey")]
    pub receive_key: String,
}

fn b64_err(e: base64::DecodeError) -> CryptoError {
    CryptoError::Encoding(e.to_string())
}

/// AES-CBC-encrypt the base64 of `plaintext` under a fresh IV. Returns
/// `(iv, ciphertext)` both base64-encoded for the wire.
pub fn seal_bytes(key: &SymmetricKey, plaintext: &[u8]) -> Result<(String, String), CryptoError> {
    let iv = Iv::generate();
    let inner = BASE64.encode(plaintext);
    let ciphertext = encrypt(key, &iv, inner.as_bytes())?;
    Ok((BASE64.encode(iv.as_bytes()), BASE64.encode(ciphertext)))
}

/// Reverse of [`seal_bytes`]
pub fn open_bytes(
    key: &SymmetricKey,
    iv_b64: &str,
    ciphertext_b64: &str,
) -> Result<Vec<u8>, CryptoError> {
    let iv = Iv::try_from_slice(&BASE64.decode(iv_b64).map_err(b64_err)?)?;
    let ciphertext = BASE64.decode(ciphertext_b64).map_err(b64_err)?;
    let inner = decrypt(key, &iv, &ciphertext)?;
    BASE64.decode(&inner).map_err(b64_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_one_field_names() {
        let msg = CoordinatorRequest::HandshakeOne(HandshakeOneRequest {
            username: "frulf".into(),
            salt: "aabb".into(),
            client_ephemeral_public: "ccdd".into(),
        });
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "srp-handshake_1");
        assert_eq!(json["payload"]["username"], "frulf");
        assert_eq!(json["payload"]["clientEphemeralPublic"], "ccdd");
    }

    #[test]
    fn test_reply_keeps_legacy_spelling() {
        let reply = CoordinatorReply::HandshakeOne {
            payload: Some(HandshakeOneReply {
                server_ephemeral_key: "eeff".into(),
            }),
            status: ReplyStatus::Success,
            error: None,
        };
        let json: serde_json::Value = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["payload"]["serverEphermalKey"], "eeff");
        assert_eq!(json["status"], "success");
        assert!(json["error"].is_null());
    }

    #[test]
    fn test_envelope_kinds() {
        let env = NodeEnvelope::seal(
            EnvelopeKind::AckHello,
            "frulf",
            &SymmetricKey::generate(),
            b"",
        )
        .unwrap();
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "ack-hello");
        assert_eq!(json["from"], "frulf");
    }

    #[test]
    fn test_seal_open_round_trip() {
        let key = SymmetricKey::generate();
        let env =
            NodeEnvelope::seal(EnvelopeKind::Message, "frulf", &key, b"hi there").unwrap();
        assert_eq!(env.open(&key).unwrap(), b"hi there");

        let wrong = SymmetricKey::generate();
        assert!(env.open(&wrong).is_err());
    }

    #[test]
    fn test_roster_field_names() {
        let roster = RosterPayload {
            nodes: vec![RosterEntry {
                username: "frulf".into(),
                ip: "192.168.1.7".into(),
                port: 50123,
                send_key: "aa".into(),
                receive_key: "bb".into(),
            }],
        };
        let json: serde_json::Value = serde_json::to_value(&roster).unwrap();
        assert_eq!(json["nodes"][0]["sendKey"], "aa");
        assert_eq!(json["nodes"][0]["receiveKey"], "bb");
    }
}
