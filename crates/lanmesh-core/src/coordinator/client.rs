//! Coordinator Client
//!
//! Opens a TLS dialer pinned to the advertised session name and drives the
//! two SRP rounds. Success yields a [`CoordinatorTicket`]: the host's node
//! endpoint (decrypted from the round-two payload) and the shared session
//! key that seeds the mesh bootstrap.

use std::net::IpAddr;

use tokio::sync::mpsc;
use tracing::{debug, info};

use lanmesh_crypto::{SrpClientAuth, SymmetricKey};
use lanmesh_network::{ChannelEvent, DialerConfig, NetError, TlsDialer};

use crate::error::{SessionError, SessionResult};
use crate::events::CoordinatorClientEvent;
use crate::wire::{
    open_bytes, CoordinatorReply, CoordinatorRequest, HandshakeOneRequest, HandshakeTwoRequest,
    ReplyStatus, SessionEndpoint,
};

/// What the joining side needs to know to authenticate
#[derive(Debug, Clone)]
pub struct CoordinatorClientConfig {
    /// Our identifier, the SRP user name
    pub identifier: String,
    /// The advertised session name (certificate pinning)
    pub session_name: String,
    /// The shared passcode
    pub passcode: String,
    /// Our node listener port, reported in round two
    pub node_port: u16,
}

/// Result of a successful handshake
#[derive(Debug, Clone)]
pub struct CoordinatorTicket {
    /// The host's user name (equals the session name)
    pub host_name: String,
    /// The host's address as observed on the coordinator connection
    pub host_ip: IpAddr,
    /// The host's node listener port
    pub host_node_port: u16,
    /// SRP-derived key shared with the host
    pub key: SymmetricKey,
}

async fn next_data(
    rx: &mut mpsc::UnboundedReceiver<(String, ChannelEvent)>,
) -> SessionResult<Vec<u8>> {
    while let Some((_, event)) = rx.recv().await {
        match event {
            ChannelEvent::Data(bytes) => return Ok(bytes),
            ChannelEvent::SocketError(e) | ChannelEvent::TlsError(e) => {
                return Err(SessionError::Tls(NetError::ConnectionFailed(e)))
            }
            ChannelEvent::SocketClosed | ChannelEvent::TlsClosed => {
                return Err(SessionError::Tls(NetError::NotConnected))
            }
            _ => {}
        }
    }
    Err(SessionError::Tls(NetError::NotConnected))
}

/// Authenticate against the coordinator at `(host, port)`
pub async fn authenticate(
    config: CoordinatorClientConfig,
    host: IpAddr,
    port: u16,
    events: mpsc::UnboundedSender<CoordinatorClientEvent>,
) -> SessionResult<CoordinatorTicket> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dialer = TlsDialer::new(
        DialerConfig {
            tag: config.session_name.clone(),
            expected_name: config.session_name.clone(),
            keep_alive: false,
        },
        tx,
    );
    dialer.connect(host, port).await?;
    let _ = events.send(CoordinatorClientEvent::Connected);

    let result = run_handshake(&config, &dialer, &mut rx, &events).await;
    dialer.destroy().await;
    result
}

async fn run_handshake(
    config: &CoordinatorClientConfig,
    dialer: &TlsDialer,
    rx: &mut mpsc::UnboundedReceiver<(String, ChannelEvent)>,
    events: &mpsc::UnboundedSender<CoordinatorClientEvent>,
) -> SessionResult<CoordinatorTicket> {
    let auth = SrpClientAuth::new(&config.identifier, &config.passcode);

    let round_one = CoordinatorRequest::HandshakeOne(HandshakeOneRequest {
        username: config.identifier.clone(),
        salt: auth.salt_hex(),
        client_ephemeral_public: auth.public_ephemeral_hex(),
    });
    dialer.send(serde_json::to_vec(&round_one)?).map_err(SessionError::from)?;
    debug!(session = %config.session_name, "sent SRP round one");

    let reply: CoordinatorReply = serde_json::from_slice(&next_data(rx).await?)?;
    let server_ephemeral_key = match reply {
        CoordinatorReply::HandshakeOne {
            payload: Some(payload),
            status: ReplyStatus::Success,
            ..
        } => payload.server_ephemeral_key,
        CoordinatorReply::HandshakeOne { error, .. }
        | CoordinatorReply::HandshakeTwo { error, .. } => {
            let message = error.unwrap_or_else(|| "coordinator rejected round one".to_string());
            let _ = events.send(CoordinatorClientEvent::Error(message.clone()));
            return Err(SessionError::CoordinatorAuth(message));
        }
    };

    let session = auth.confirm(&server_ephemeral_key)?;
    let round_two = CoordinatorRequest::HandshakeTwo(HandshakeTwoRequest {
        session_proof: session.proof_hex(),
        username: config.identifier.clone(),
        node_port: config.node_port,
    });
    dialer.send(serde_json::to_vec(&round_two)?).map_err(SessionError::from)?;
    debug!(session = %config.session_name, "sent SRP round two");

    let reply: CoordinatorReply = serde_json::from_slice(&next_data(rx).await?)?;
    let payload = match reply {
        CoordinatorReply::HandshakeTwo {
            payload: Some(payload),
            status: ReplyStatus::Success,
            ..
        } => payload,
        CoordinatorReply::HandshakeOne { error, .. }
        | CoordinatorReply::HandshakeTwo { error, .. } => {
            let message = error.unwrap_or_else(|| "coordinator rejected round two".to_string());
            let _ = events.send(CoordinatorClientEvent::Error(message.clone()));
            return Err(SessionError::CoordinatorAuth(message));
        }
    };

    session.verify_server(&payload.server_proof)?;
    let key = SymmetricKey::try_from_slice(session.key())?;
    let endpoint_json = open_bytes(&key, &payload.iv, &payload.encrypted)?;
    let endpoint: SessionEndpoint = serde_json::from_slice(&endpoint_json)?;
    let host_ip: IpAddr = endpoint
        .ip
        .parse()
        .map_err(|_| SessionError::Protocol(format!("bad host address '{}'", endpoint.ip)))?;

    info!(session = %config.session_name, host = %host_ip, "authenticated to coordinator");
    let _ = events.send(CoordinatorClientEvent::Authenticated);
    Ok(CoordinatorTicket {
        host_name: endpoint.user_name,
        host_ip,
        host_node_port: endpoint.port,
        key,
    })
}
