//! Shared Node Machinery
//!
//! The event loop consuming listener and dialer events, the message
//! handlers for the `hello` / `ack-hello` bootstrap and application
//! traffic, and the reconnection controller.
//!
//! Reconnection rules: a hard disconnect on every neighbor, a soft
//! disconnect on every neighbor (with none hard), or a listener-side
//! heartbeat timeout on every neighbor triggers a full reconnect, which
//! rebuilds the TLS listener (residual listener state can wedge future
//! accepts) and re-dials every hard-disconnected neighbor. A known peer
//! re-appearing on the listener from a new remote port triggers a per-peer
//! reconnect only. One `reconnecting` flag suppresses concurrent rebuilds;
//! one `rebuilding_socket` flag per neighbor suppresses concurrent
//! re-handshakes.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use lanmesh_crypto::{RsaKeyMaterial, SymmetricKey};
use lanmesh_network::{ChannelEvent, ListenerEvent, NetError, TlsListener};

use super::neighbor::Neighbor;
use crate::error::{SessionError, SessionResult};
use crate::events::NodeEvent;
use crate::wire::{EnvelopeKind, NodeEnvelope, RosterPayload};

/// Delay between re-dial attempts for an unreachable neighbor
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(1000);

pub(crate) struct NodeShared {
    pub identifier: String,
    pub node_port: u16,
    pub keypair: RsaKeyMaterial,
    pub neighbors: RwLock<HashMap<String, Neighbor>>,
    pub dialer_events: mpsc::UnboundedSender<(String, ChannelEvent)>,
    pub events: mpsc::UnboundedSender<NodeEvent>,
    pub reconnecting: AtomicBool,
    pub listener: Mutex<Option<TlsListener>>,
    pub destroyed: AtomicBool,
}

impl NodeShared {
    pub fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }
}

/// Role-specific bootstrap state owned by the event loop
pub(crate) enum RoleRuntime {
    Host {
        acked: HashSet<String>,
        started: bool,
    },
    Client {
        host_name: String,
        hello_done: bool,
        started: bool,
    },
}

/// Shared base of [`super::HostNode`] and [`super::ClientNode`]
pub struct MeshNode {
    pub(crate) shared: Arc<NodeShared>,
    loop_task: JoinHandle<()>,
}

impl MeshNode {
    pub(crate) async fn new(
        identifier: &str,
        node_port: u16,
        keypair: RsaKeyMaterial,
        events: mpsc::UnboundedSender<NodeEvent>,
        role: RoleRuntime,
    ) -> SessionResult<Self> {
        let (dialer_tx, dialer_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(NodeShared {
            identifier: identifier.to_string(),
            node_port,
            keypair,
            neighbors: RwLock::new(HashMap::new()),
            dialer_events: dialer_tx,
            events,
            reconnecting: AtomicBool::new(false),
            listener: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let (listener, listener_rx) = TlsListener::new(identifier, true);
        listener.listen(node_port, &shared.keypair).await?;
        *shared.listener.lock().await = Some(listener);

        let loop_task = tokio::spawn(run_event_loop(shared.clone(), role, listener_rx, dialer_rx));
        Ok(Self { shared, loop_task })
    }

    /// Send an application message to one neighbor; waits for that
    /// neighbor's channel to be ready.
    pub async fn send_message(&self, user: &str, text: &str) -> SessionResult<()> {
        send_to_peer(
            &self.shared,
            user,
            EnvelopeKind::Message,
            text.as_bytes().to_vec(),
        )
        .await
    }

    /// Send an application message to every neighbor
    pub async fn broadcast_message(&self, text: &str) {
        let users: Vec<String> = self.shared.neighbors.read().await.keys().cloned().collect();
        for user in users {
            let shared = self.shared.clone();
            let text = text.to_string();
            tokio::spawn(async move {
                if let Err(e) =
                    send_to_peer(&shared, &user, EnvelopeKind::Broadcast, text.into_bytes()).await
                {
                    debug!(user = %user, "broadcast delivery failed: {e}");
                }
            });
        }
    }

    /// Neighbor user names
    pub async fn neighbor_names(&self) -> Vec<String> {
        self.shared.neighbors.read().await.keys().cloned().collect()
    }

    /// Per-pair keys as hex, for inspection
    pub async fn neighbor_keys(&self, user: &str) -> Option<(String, String)> {
        self.shared
            .neighbors
            .read()
            .await
            .get(user)
            .map(|n| (n.send_key.to_hex(), n.receive_key.to_hex()))
    }

    /// Tear everything down. Idempotent.
    pub async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.loop_task.abort();
        if let Some(listener) = self.shared.listener.lock().await.take() {
            listener.destroy().await;
        }
        let mut neighbors = self.shared.neighbors.write().await;
        for neighbor in neighbors.values() {
            neighbor.dialer.destroy().await;
        }
        neighbors.clear();
    }
}

async fn run_event_loop(
    shared: Arc<NodeShared>,
    mut role: RoleRuntime,
    mut listener_rx: mpsc::UnboundedReceiver<ListenerEvent>,
    mut dialer_rx: mpsc::UnboundedReceiver<(String, ChannelEvent)>,
) {
    loop {
        tokio::select! {
            maybe = listener_rx.recv() => match maybe {
                Some(event) => {
                    if let Some(new_rx) = handle_listener_event(&shared, &mut role, event).await {
                        listener_rx = new_rx;
                    }
                }
                None => {
                    if shared.destroyed.load(Ordering::SeqCst) {
                        break;
                    }
                    // listener generation gone without a replacement; avoid
                    // spinning on the closed receiver
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            },
            maybe = dialer_rx.recv() => match maybe {
                Some((user, event)) => {
                    if let Some(new_rx) = handle_dialer_event(&shared, &mut role, &user, event).await {
                        listener_rx = new_rx;
                    }
                }
                None => break,
            },
        }
    }
}

async fn handle_dialer_event(
    shared: &Arc<NodeShared>,
    role: &mut RoleRuntime,
    user: &str,
    event: ChannelEvent,
) -> Option<mpsc::UnboundedReceiver<ListenerEvent>> {
    match event {
        ChannelEvent::TlsConnected => {
            let mut neighbors = shared.neighbors.write().await;
            if let Some(n) = neighbors.get_mut(user) {
                n.disconnected = false;
                n.soft_disconnected = false;
                n.server_soft_disconnected = false;
                n.rebuilding_socket = false;
                let _ = n.ready_tx.send_replace(true);
                shared.emit(NodeEvent::PeerConnected(user.to_string()));
                if let RoleRuntime::Client {
                    host_name, started, ..
                } = role
                {
                    // the first channel to the host marks the session live
                    if user == host_name.as_str() && !*started {
                        *started = true;
                        shared.emit(NodeEvent::SessionStarted);
                    }
                }
            }
            None
        }
        ChannelEvent::SocketClosed => {
            let trigger = {
                let mut neighbors = shared.neighbors.write().await;
                let Some(n) = neighbors.get_mut(user) else {
                    return None;
                };
                let was_down = n.down();
                n.disconnected = true;
                let _ = n.ready_tx.send_replace(false);
                if !was_down {
                    shared.emit(NodeEvent::PeerDisconnected(user.to_string()));
                }
                !neighbors.is_empty() && neighbors.values().all(|n| n.disconnected)
            };
            if trigger {
                full_reconnect(shared).await
            } else {
                None
            }
        }
        ChannelEvent::Disconnected => {
            let trigger = {
                let mut neighbors = shared.neighbors.write().await;
                let Some(n) = neighbors.get_mut(user) else {
                    return None;
                };
                let was_down = n.down();
                n.soft_disconnected = true;
                if !was_down {
                    shared.emit(NodeEvent::PeerDisconnected(user.to_string()));
                }
                !neighbors.is_empty()
                    && neighbors.values().all(|n| n.soft_disconnected)
                    && !neighbors.values().any(|n| n.disconnected)
            };
            if trigger {
                full_reconnect(shared).await
            } else {
                None
            }
        }
        ChannelEvent::Reconnected => {
            let mut neighbors = shared.neighbors.write().await;
            if let Some(n) = neighbors.get_mut(user) {
                n.soft_disconnected = false;
                shared.emit(NodeEvent::PeerReconnected(user.to_string()));
            }
            None
        }
        ChannelEvent::SocketError(e) | ChannelEvent::TlsError(e) => {
            trace!(user, "channel error: {e}");
            None
        }
        _ => None,
    }
}

async fn handle_listener_event(
    shared: &Arc<NodeShared>,
    role: &mut RoleRuntime,
    event: ListenerEvent,
) -> Option<mpsc::UnboundedReceiver<ListenerEvent>> {
    match event {
        ListenerEvent::Accepted { peer, .. } => {
            let reconnect_user = {
                let mut neighbors = shared.neighbors.write().await;
                let hit = neighbors.values_mut().find(|n| n.ip == peer.ip());
                match hit {
                    Some(n) => match n.listener_port {
                        // the peer rebuilt its socket; rebuild ours toward it
                        Some(prev) if prev != peer.port() => {
                            n.listener_port = Some(peer.port());
                            n.disconnected = true;
                            let _ = n.ready_tx.send_replace(false);
                            Some(n.username.clone())
                        }
                        _ => {
                            n.listener_port = Some(peer.port());
                            None
                        }
                    },
                    None => None,
                }
            };
            if let Some(user) = reconnect_user {
                debug!(user = %user, "peer re-dialed from a new port; rebuilding our dialer");
                spawn_dial(shared.clone(), user);
            }
            None
        }
        ListenerEvent::PeerDisconnected { peer, .. } => {
            let trigger = {
                let mut neighbors = shared.neighbors.write().await;
                if let Some(n) = neighbors.values_mut().find(|n| n.ip == peer.ip()) {
                    n.server_soft_disconnected = true;
                }
                !neighbors.is_empty() && neighbors.values().all(|n| n.server_soft_disconnected)
            };
            if trigger {
                full_reconnect(shared).await
            } else {
                None
            }
        }
        ListenerEvent::PeerReconnected { peer, .. } => {
            let mut neighbors = shared.neighbors.write().await;
            if let Some(n) = neighbors.values_mut().find(|n| n.ip == peer.ip()) {
                n.server_soft_disconnected = false;
            }
            None
        }
        ListenerEvent::Data { peer, bytes, .. } => {
            handle_envelope(shared, role, peer, bytes).await;
            None
        }
        ListenerEvent::Error { peer, error } => {
            trace!(?peer, "listener error: {error}");
            None
        }
        _ => None,
    }
}

async fn handle_envelope(
    shared: &Arc<NodeShared>,
    role: &mut RoleRuntime,
    peer: SocketAddr,
    bytes: Vec<u8>,
) {
    // unknown or malformed messages are dropped silently
    let Ok(envelope) = serde_json::from_slice::<NodeEnvelope>(&bytes) else {
        trace!(%peer, "dropping malformed node message");
        return;
    };
    match envelope.kind {
        EnvelopeKind::Hello => handle_hello(shared, role, peer, envelope).await,
        EnvelopeKind::AckHello => handle_ack_hello(shared, role, peer, envelope).await,
        EnvelopeKind::Message | EnvelopeKind::Broadcast => {
            handle_message(shared, peer, envelope).await
        }
    }
}

async fn handle_hello(
    shared: &Arc<NodeShared>,
    role: &mut RoleRuntime,
    peer: SocketAddr,
    envelope: NodeEnvelope,
) {
    let RoleRuntime::Client {
        host_name,
        hello_done,
        ..
    } = role
    else {
        return;
    };
    if *hello_done {
        return;
    }

    let host_key = {
        let neighbors = shared.neighbors.read().await;
        // the roster only applies while the host is the sole neighbor
        if neighbors.len() != 1 {
            return;
        }
        let Some(host) = neighbors.get(host_name.as_str()) else {
            return;
        };
        // hello must come from the host's pinned address
        if envelope.from != *host_name || host.ip != peer.ip() {
            return;
        }
        host.receive_key.clone()
    };

    let roster_bytes = match envelope.open(&host_key) {
        Ok(bytes) => bytes,
        Err(_) => {
            shared.emit(NodeEvent::EncryptError {
                fn_name: "handle_hello",
                username: envelope.from,
                message_type: EnvelopeKind::Hello.as_str().to_string(),
            });
            return;
        }
    };
    let Ok(roster) = serde_json::from_slice::<RosterPayload>(&roster_bytes) else {
        warn!("dropping undecodable roster");
        return;
    };

    // our own row tells us which key the other members will use toward us
    let Some(self_row) = roster
        .nodes
        .iter()
        .find(|n| n.username == shared.identifier)
    else {
        warn!("roster is missing our own entry; ignoring");
        return;
    };
    let Ok(receive_key) = SymmetricKey::from_hex(&self_row.receive_key) else {
        warn!("roster carries a malformed receive key; ignoring");
        return;
    };

    let mut added = Vec::new();
    {
        let mut neighbors = shared.neighbors.write().await;
        for row in &roster.nodes {
            if row.username == shared.identifier || neighbors.contains_key(&row.username) {
                continue;
            }
            let Ok(send_key) = SymmetricKey::from_hex(&row.send_key) else {
                warn!(username = %row.username, "skipping roster row with bad send key");
                continue;
            };
            let Ok(ip) = row.ip.parse() else {
                warn!(username = %row.username, "skipping roster row with bad address");
                continue;
            };
            neighbors.insert(
                row.username.clone(),
                Neighbor::new(
                    &row.username,
                    ip,
                    row.port,
                    send_key,
                    receive_key.clone(),
                    shared.dialer_events.clone(),
                ),
            );
            added.push(row.username.clone());
        }
    }
    *hello_done = true;
    info!(peers = added.len(), "roster installed; dialing mesh peers");

    for user in added {
        spawn_dial(shared.clone(), user);
    }

    // acknowledge so the host can count the mesh as formed
    let ack_shared = shared.clone();
    let ack_target = host_name.clone();
    tokio::spawn(async move {
        if let Err(e) = send_to_peer(&ack_shared, &ack_target, EnvelopeKind::AckHello, Vec::new()).await
        {
            warn!("failed to acknowledge roster: {e}");
        }
    });
}

async fn handle_ack_hello(
    shared: &Arc<NodeShared>,
    role: &mut RoleRuntime,
    peer: SocketAddr,
    envelope: NodeEnvelope,
) {
    let RoleRuntime::Host { acked, started } = role else {
        return;
    };
    let from = envelope.from.clone();
    let (receive_key, total) = {
        let neighbors = shared.neighbors.read().await;
        let Some(n) = neighbors.get(&from) else {
            return;
        };
        // ack-hello must come from the member's pinned address
        if n.ip != peer.ip() {
            return;
        }
        (n.receive_key.clone(), neighbors.len())
    };
    if envelope.open(&receive_key).is_err() {
        shared.emit(NodeEvent::EncryptError {
            fn_name: "handle_ack_hello",
            username: from,
            message_type: EnvelopeKind::AckHello.as_str().to_string(),
        });
        return;
    }
    if *started {
        return;
    }
    acked.insert(from);
    if acked.len() == total {
        *started = true;
        acked.clear();
        info!("all members acknowledged; session started");
        shared.emit(NodeEvent::SessionStarted);
    }
}

async fn handle_message(shared: &Arc<NodeShared>, peer: SocketAddr, envelope: NodeEnvelope) {
    let from = envelope.from.clone();
    let receive_key = {
        let neighbors = shared.neighbors.read().await;
        match neighbors.get(&from) {
            Some(n) => n.receive_key.clone(),
            None => {
                trace!(%peer, from = %from, "dropping message from unknown sender");
                return;
            }
        }
    };
    match envelope.open(&receive_key) {
        Ok(bytes) => shared.emit(NodeEvent::Message {
            from,
            text: String::from_utf8_lossy(&bytes).into_owned(),
            broadcast: envelope.kind == EnvelopeKind::Broadcast,
        }),
        Err(_) => shared.emit(NodeEvent::EncryptError {
            fn_name: "handle_message",
            username: from,
            message_type: envelope.kind.as_str().to_string(),
        }),
    }
}

/// Encrypt and send one envelope; waits for the neighbor's channel
pub(crate) async fn send_to_peer(
    shared: &Arc<NodeShared>,
    user: &str,
    kind: EnvelopeKind,
    payload: Vec<u8>,
) -> SessionResult<()> {
    let (mut ready, send_key, dialer) = {
        let neighbors = shared.neighbors.read().await;
        let n = neighbors
            .get(user)
            .ok_or_else(|| SessionError::Protocol(format!("unknown peer '{user}'")))?;
        (n.ready_rx.clone(), n.send_key.clone(), n.dialer.clone())
    };
    ready
        .wait_for(|ready| *ready)
        .await
        .map_err(|_| SessionError::Tls(NetError::NotConnected))?;

    let envelope = match NodeEnvelope::seal(kind, &shared.identifier, &send_key, &payload) {
        Ok(envelope) => envelope,
        Err(_) => {
            shared.emit(NodeEvent::EncryptError {
                fn_name: "send_to_peer",
                username: user.to_string(),
                message_type: kind.as_str().to_string(),
            });
            return Err(SessionError::NodeEncrypt {
                fn_name: "send_to_peer",
                username: user.to_string(),
                message_type: kind.as_str().to_string(),
            });
        }
    };
    dialer.send(serde_json::to_vec(&envelope)?)?;
    Ok(())
}

/// Dial (or re-dial) a neighbor until the handshake lands, with backoff.
/// Guarded by `rebuilding_socket` so only one attempt runs per neighbor.
pub(crate) fn spawn_dial(shared: Arc<NodeShared>, user: String) {
    tokio::spawn(async move {
        let (dialer, ip, port) = {
            let mut neighbors = shared.neighbors.write().await;
            let Some(n) = neighbors.get_mut(&user) else {
                return;
            };
            if n.rebuilding_socket {
                return;
            }
            n.rebuilding_socket = true;
            let _ = n.ready_tx.send_replace(false);
            (n.dialer.clone(), n.ip, n.server_port)
        };

        dialer.rebuild().await;
        loop {
            if shared.destroyed.load(Ordering::SeqCst) {
                break;
            }
            match dialer.connect(ip, port).await {
                // the TlsConnected event clears rebuilding_socket
                Ok(()) => return,
                Err(e) => {
                    trace!(user = %user, "dial failed, retrying: {e}");
                    tokio::time::sleep(DIAL_RETRY_DELAY).await;
                }
            }
        }
        if let Some(n) = shared.neighbors.write().await.get_mut(&user) {
            n.rebuilding_socket = false;
        }
    });
}

/// Tear down and rebuild the listener, then re-dial every hard-disconnected
/// neighbor. Returns the new listener's event receiver for the event loop.
async fn full_reconnect(
    shared: &Arc<NodeShared>,
) -> Option<mpsc::UnboundedReceiver<ListenerEvent>> {
    if shared.reconnecting.swap(true, Ordering::SeqCst) {
        return None;
    }
    info!("mesh connectivity lost; running full reconnect");

    let any_unhealthy = shared
        .neighbors
        .read()
        .await
        .values()
        .any(|n| !n.healthy());
    let mut new_rx = None;
    if any_unhealthy {
        let mut guard = shared.listener.lock().await;
        if let Some(old) = guard.take() {
            old.destroy().await;
        }
        let (listener, rx) = TlsListener::new(&shared.identifier, true);
        match listener.listen(shared.node_port, &shared.keypair).await {
            Ok(()) => {
                *guard = Some(listener);
                new_rx = Some(rx);
            }
            Err(e) => warn!("listener rebuild failed: {e}"),
        }
    }

    let to_redial: Vec<String> = shared
        .neighbors
        .read()
        .await
        .iter()
        .filter(|(_, n)| n.disconnected)
        .map(|(user, _)| user.clone())
        .collect();
    for user in to_redial {
        spawn_dial(shared.clone(), user);
    }

    shared.reconnecting.store(false, Ordering::SeqCst);
    new_rx
}
