//! Coordinator Server
//!
//! Listens on the coordinator port behind a certificate pinned to
//! `<sessionName>:<coordinatorPort>` and runs the per-client SRP state
//! machine. The IP observed during round one is pinned to the user name;
//! round two must come from the same address. Failed attempts aggregate per
//! source IP and lock the address out after [`MAX_AUTH_ATTEMPTS`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lanmesh_crypto::{RsaKeyMaterial, SrpServerAuth, SymmetricKey};
use lanmesh_network::{ListenerEvent, TlsListener};

use super::MAX_AUTH_ATTEMPTS;
use crate::error::SessionResult;
use crate::events::CoordinatorEvent;
use crate::wire::{
    seal_bytes, CoordinatorReply, CoordinatorRequest, HandshakeOneReply, HandshakeOneRequest,
    HandshakeTwoReply, HandshakeTwoRequest, ReplyStatus, SessionEndpoint,
};

const ERR_IP_MISMATCH: &str =
    "Username does not match initial IP Address. Please try joining again.";
const ERR_TOO_MANY_ATTEMPTS: &str =
    "Too many failed authentication attempts. Please start a new session.";
const ERR_UNVERIFIED: &str = "Unable to verify client. Please try joining again.";

fn collision_error(username: &str) -> String {
    format!("Username '{username}' already registered. Please choose a different name.")
}

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Advertised session name, also the certificate name half
    pub session_name: String,
    /// Six-digit session passcode (the SRP password)
    pub passcode: String,
    /// TCP port to listen on
    pub port: u16,
    /// The host's node listener port, sent to clients in round two
    pub host_node_port: u16,
}

/// A member that completed SRP, as exported to the mesh bootstrap
#[derive(Debug, Clone)]
pub struct AuthenticatedMember {
    pub user_name: String,
    pub ip: IpAddr,
    pub node_port: u16,
    /// SRP-derived shared secret for this member
    pub session_key: SymmetricKey,
}

impl AuthenticatedMember {
    pub fn session_key_hex(&self) -> String {
        self.session_key.to_hex()
    }
}

struct UserRecord {
    client_ephemeral_public: String,
    srp: SrpServerAuth,
}

struct ClientRecord {
    retry_count: u32,
    ip: IpAddr,
    registered: bool,
}

pub(crate) struct CoordState {
    config: CoordinatorConfig,
    users: HashMap<String, UserRecord>,
    clients: HashMap<String, ClientRecord>,
    authenticated: Vec<AuthenticatedMember>,
}

fn round_one_error(error: String) -> CoordinatorReply {
    CoordinatorReply::HandshakeOne {
        payload: None,
        status: ReplyStatus::Error,
        error: Some(error),
    }
}

fn round_two_error(error: String) -> CoordinatorReply {
    CoordinatorReply::HandshakeTwo {
        payload: None,
        status: ReplyStatus::Error,
        error: Some(error),
    }
}

impl CoordState {
    fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            users: HashMap::new(),
            clients: HashMap::new(),
            authenticated: Vec::new(),
        }
    }

    fn two_fail(
        &self,
        username: &str,
        ip: IpAddr,
        error: &str,
    ) -> (CoordinatorReply, Option<CoordinatorEvent>) {
        (
            round_two_error(error.to_string()),
            Some(CoordinatorEvent::ConnectionAttemptFail {
                username: username.to_string(),
                ip,
                error: error.to_string(),
            }),
        )
    }

    fn handle_round_one(
        &mut self,
        peer_ip: IpAddr,
        req: HandshakeOneRequest,
    ) -> (CoordinatorReply, Option<CoordinatorEvent>) {
        if let Some(existing) = self.clients.get(&req.username) {
            // a collision from another device never evicts the registrant
            if existing.ip != peer_ip {
                return (round_one_error(collision_error(&req.username)), None);
            }
        }

        let salt = match hex::decode(&req.salt) {
            Ok(salt) => salt,
            Err(_) => {
                return (
                    round_one_error(ERR_UNVERIFIED.to_string()),
                    Some(CoordinatorEvent::ConnectionAttemptFail {
                        username: req.username,
                        ip: peer_ip,
                        error: ERR_UNVERIFIED.to_string(),
                    }),
                )
            }
        };

        // register-and-login: the verifier comes from the passcode we hold
        let srp = SrpServerAuth::new(&req.username, &self.config.passcode, &salt);
        let server_ephemeral_key = srp.public_ephemeral_hex();

        match self.clients.entry(req.username.clone()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                // same IP re-running round one counts against the budget
                entry.get_mut().retry_count += 1;
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(ClientRecord {
                    retry_count: 0,
                    ip: peer_ip,
                    registered: false,
                });
            }
        }
        self.users.insert(
            req.username.clone(),
            UserRecord {
                client_ephemeral_public: req.client_ephemeral_public,
                srp,
            },
        );

        debug!(username = %req.username, ip = %peer_ip, "SRP round one accepted");
        (
            CoordinatorReply::HandshakeOne {
                payload: Some(HandshakeOneReply {
                    server_ephemeral_key,
                }),
                status: ReplyStatus::Success,
                error: None,
            },
            Some(CoordinatorEvent::ConnectionAttempt {
                username: req.username,
                ip: peer_ip,
            }),
        )
    }

    fn handle_round_two(
        &mut self,
        peer_ip: IpAddr,
        local_ip: IpAddr,
        req: HandshakeTwoRequest,
    ) -> (CoordinatorReply, Option<CoordinatorEvent>) {
        let Some(client) = self.clients.get(&req.username) else {
            return self.two_fail(&req.username, peer_ip, ERR_UNVERIFIED);
        };
        if client.ip != peer_ip {
            return self.two_fail(&req.username, peer_ip, ERR_IP_MISMATCH);
        }

        let attempts: u32 = self
            .clients
            .values()
            .filter(|c| c.ip == peer_ip)
            .map(|c| c.retry_count)
            .sum();
        if attempts >= MAX_AUTH_ATTEMPTS {
            return self.two_fail(&req.username, peer_ip, ERR_TOO_MANY_ATTEMPTS);
        }

        let Some(user) = self.users.get(&req.username) else {
            return self.two_fail(&req.username, peer_ip, ERR_UNVERIFIED);
        };

        let session = match user
            .srp
            .verify(&user.client_ephemeral_public, &req.session_proof)
        {
            Ok(session) => session,
            Err(e) => {
                debug!(username = %req.username, "SRP proof rejected: {e}");
                if let Some(client) = self.clients.get_mut(&req.username) {
                    client.retry_count += 1;
                }
                return self.two_fail(&req.username, peer_ip, ERR_UNVERIFIED);
            }
        };

        let Ok(session_key) = SymmetricKey::try_from_slice(session.key()) else {
            return self.two_fail(&req.username, peer_ip, ERR_UNVERIFIED);
        };

        let endpoint = SessionEndpoint {
            user_name: self.config.session_name.clone(),
            ip: local_ip.to_string(),
            port: self.config.host_node_port,
        };
        let Ok(endpoint_json) = serde_json::to_vec(&endpoint) else {
            return self.two_fail(&req.username, peer_ip, ERR_UNVERIFIED);
        };
        let Ok((iv, encrypted)) = seal_bytes(&session_key, &endpoint_json) else {
            return self.two_fail(&req.username, peer_ip, ERR_UNVERIFIED);
        };

        let member = AuthenticatedMember {
            user_name: req.username.clone(),
            ip: peer_ip,
            node_port: req.node_port,
            session_key,
        };
        // same-IP re-authentication replaces the entry; the collision rule
        // above keeps other devices out of this slot
        match self
            .authenticated
            .iter_mut()
            .find(|m| m.user_name == req.username)
        {
            Some(slot) => *slot = member,
            None => self.authenticated.push(member),
        }
        if let Some(client) = self.clients.get_mut(&req.username) {
            client.registered = true;
        }

        info!(username = %req.username, ip = %peer_ip, "member authenticated");
        (
            CoordinatorReply::HandshakeTwo {
                payload: Some(HandshakeTwoReply {
                    iv,
                    encrypted,
                    server_proof: session.proof_hex(),
                }),
                status: ReplyStatus::Success,
                error: None,
            },
            Some(CoordinatorEvent::Connected {
                username: req.username,
            }),
        )
    }

    fn export_users(&self) -> Vec<AuthenticatedMember> {
        debug_assert!(
            {
                let mut names: Vec<_> = self.authenticated.iter().map(|m| &m.user_name).collect();
                names.sort();
                names.windows(2).all(|w| w[0] != w[1])
            },
            "authenticated roster must not contain duplicate user names"
        );
        self.authenticated.clone()
    }
}

/// Coordinator endpoint: TLS listener plus the SRP state machine
pub struct CoordinatorServer {
    state: Arc<RwLock<CoordState>>,
    listener: TlsListener,
    task: JoinHandle<()>,
}

impl CoordinatorServer {
    /// Bind the coordinator port and start serving handshakes
    pub async fn start(
        config: CoordinatorConfig,
        keypair: &RsaKeyMaterial,
        events: mpsc::UnboundedSender<CoordinatorEvent>,
    ) -> SessionResult<Self> {
        let (listener, mut listener_rx) = TlsListener::new(&config.session_name, false);
        listener.listen(config.port, keypair).await?;

        let state = Arc::new(RwLock::new(CoordState::new(config)));
        let loop_state = state.clone();
        let loop_listener = listener.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = listener_rx.recv().await {
                let ListenerEvent::Data {
                    conn,
                    peer,
                    local,
                    bytes,
                } = event
                else {
                    continue;
                };
                // unknown or malformed messages are dropped silently
                let Ok(request) = serde_json::from_slice::<CoordinatorRequest>(&bytes) else {
                    continue;
                };
                let (reply, event) = {
                    let mut st = loop_state.write().await;
                    match request {
                        CoordinatorRequest::HandshakeOne(req) => {
                            st.handle_round_one(peer.ip(), req)
                        }
                        CoordinatorRequest::HandshakeTwo(req) => {
                            st.handle_round_two(peer.ip(), local.ip(), req)
                        }
                    }
                };
                match serde_json::to_vec(&reply) {
                    Ok(bytes) => {
                        if let Err(e) = loop_listener.send_to(conn, bytes) {
                            warn!(%peer, "failed to answer coordinator client: {e}");
                        }
                    }
                    Err(e) => warn!("failed to serialize coordinator reply: {e}"),
                }
                if let Some(event) = event {
                    let _ = events.send(event);
                }
            }
        });

        Ok(Self {
            state,
            listener,
            task,
        })
    }

    /// The authenticated roster joined with each member's session key
    pub async fn export_users(&self) -> Vec<AuthenticatedMember> {
        self.state.read().await.export_users()
    }

    /// Stop listening; terminal for this coordinator
    pub async fn stop(&self) {
        self.task.abort();
        self.listener.destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanmesh_crypto::SrpClientAuth;

    fn state() -> CoordState {
        CoordState::new(CoordinatorConfig {
            session_name: "blorp-glork".into(),
            passcode: "123456".into(),
            port: 50000,
            host_node_port: 50001,
        })
    }

    fn round_one(username: &str, auth: &SrpClientAuth) -> HandshakeOneRequest {
        HandshakeOneRequest {
            username: username.into(),
            salt: auth.salt_hex(),
            client_ephemeral_public: auth.public_ephemeral_hex(),
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn server_ephemeral(reply: &CoordinatorReply) -> String {
        match reply {
            CoordinatorReply::HandshakeOne {
                payload: Some(p),
                status: ReplyStatus::Success,
                ..
            } => p.server_ephemeral_key.clone(),
            other => panic!("expected successful round one, got {other:?}"),
        }
    }

    #[test]
    fn test_successful_handshake_exports_member() {
        let mut st = state();
        let auth = SrpClientAuth::new("frulf", "123456");

        let (reply, event) = st.handle_round_one(ip("192.168.1.7"), round_one("frulf", &auth));
        assert!(matches!(
            event,
            Some(CoordinatorEvent::ConnectionAttempt { .. })
        ));
        let session = auth.confirm(&server_ephemeral(&reply)).unwrap();

        let (reply, event) = st.handle_round_two(
            ip("192.168.1.7"),
            ip("192.168.1.1"),
            HandshakeTwoRequest {
                session_proof: session.proof_hex(),
                username: "frulf".into(),
                node_port: 50123,
            },
        );
        assert!(matches!(event, Some(CoordinatorEvent::Connected { .. })));
        let CoordinatorReply::HandshakeTwo {
            payload: Some(payload),
            status: ReplyStatus::Success,
            ..
        } = reply
        else {
            panic!("expected successful round two");
        };
        session.verify_server(&payload.server_proof).unwrap();

        let members = st.export_users();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_name, "frulf");
        assert_eq!(members[0].node_port, 50123);
        assert_eq!(members[0].ip, ip("192.168.1.7"));
        assert_eq!(members[0].session_key_hex().len(), 64);
        assert_eq!(members[0].session_key.as_bytes(), &{
            let mut k = [0u8; 32];
            k.copy_from_slice(session.key());
            k
        });
    }

    #[test]
    fn test_collision_rejected_without_eviction() {
        let mut st = state();
        let auth = SrpClientAuth::new("dup", "123456");
        st.handle_round_one(ip("192.168.1.7"), round_one("dup", &auth));

        let other = SrpClientAuth::new("dup", "123456");
        let (reply, _) = st.handle_round_one(ip("192.168.1.8"), round_one("dup", &other));
        let CoordinatorReply::HandshakeOne {
            status: ReplyStatus::Error,
            error: Some(error),
            ..
        } = reply
        else {
            panic!("expected collision error");
        };
        assert!(error.contains("Username 'dup' already registered"));

        // the original registrant is still pinned to its IP
        assert_eq!(st.clients["dup"].ip, ip("192.168.1.7"));
    }

    #[test]
    fn test_round_two_pins_initial_ip() {
        let mut st = state();
        let auth = SrpClientAuth::new("frulf", "123456");
        let (reply, _) = st.handle_round_one(ip("192.168.1.7"), round_one("frulf", &auth));
        let session = auth.confirm(&server_ephemeral(&reply)).unwrap();

        let (reply, event) = st.handle_round_two(
            ip("192.168.1.9"),
            ip("192.168.1.1"),
            HandshakeTwoRequest {
                session_proof: session.proof_hex(),
                username: "frulf".into(),
                node_port: 50123,
            },
        );
        let CoordinatorReply::HandshakeTwo {
            status: ReplyStatus::Error,
            error: Some(error),
            ..
        } = reply
        else {
            panic!("expected IP mismatch error");
        };
        assert!(error.contains("does not match initial IP Address"));
        assert!(matches!(
            event,
            Some(CoordinatorEvent::ConnectionAttemptFail { .. })
        ));
        assert!(st.export_users().is_empty());
    }

    #[test]
    fn test_retry_lockout_survives_correct_proof() {
        let mut st = state();
        let auth = SrpClientAuth::new("frulf", "123456");
        let (reply, _) = st.handle_round_one(ip("192.168.1.7"), round_one("frulf", &auth));
        let session = auth.confirm(&server_ephemeral(&reply)).unwrap();

        for _ in 0..3 {
            let (reply, _) = st.handle_round_two(
                ip("192.168.1.7"),
                ip("192.168.1.1"),
                HandshakeTwoRequest {
                    session_proof: hex::encode([0u8; 32]),
                    username: "frulf".into(),
                    node_port: 50123,
                },
            );
            let CoordinatorReply::HandshakeTwo {
                status: ReplyStatus::Error,
                error: Some(error),
                ..
            } = reply
            else {
                panic!("expected proof rejection");
            };
            assert!(error.contains("Unable to verify client"));
        }

        // fourth attempt carries the correct proof and is still locked out
        let (reply, _) = st.handle_round_two(
            ip("192.168.1.7"),
            ip("192.168.1.1"),
            HandshakeTwoRequest {
                session_proof: session.proof_hex(),
                username: "frulf".into(),
                node_port: 50123,
            },
        );
        let CoordinatorReply::HandshakeTwo {
            status: ReplyStatus::Error,
            error: Some(error),
            ..
        } = reply
        else {
            panic!("expected lockout");
        };
        assert!(error.contains("Too many failed authentication attempts"));
        assert!(st.export_users().is_empty());
    }

    #[test]
    fn test_wrong_passcode_rejected() {
        let mut st = state();
        let auth = SrpClientAuth::new("frulf", "654321");
        let (reply, _) = st.handle_round_one(ip("192.168.1.7"), round_one("frulf", &auth));
        let session = auth.confirm(&server_ephemeral(&reply)).unwrap();

        let (reply, _) = st.handle_round_two(
            ip("192.168.1.7"),
            ip("192.168.1.1"),
            HandshakeTwoRequest {
                session_proof: session.proof_hex(),
                username: "frulf".into(),
                node_port: 50123,
            },
        );
        let CoordinatorReply::HandshakeTwo {
            status: ReplyStatus::Error,
            error: Some(error),
            ..
        } = reply
        else {
            panic!("expected SRP failure");
        };
        assert_eq!(error, ERR_UNVERIFIED);
        assert!(st.export_users().is_empty());
    }
}
