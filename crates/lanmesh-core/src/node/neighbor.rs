//! Neighbor Table Entries

use std::net::IpAddr;

use tokio::sync::watch;

use lanmesh_crypto::SymmetricKey;
use lanmesh_network::{DialerConfig, TaggedEventTx, TlsDialer};

/// Per-peer connection state. Created when the host adds a member or a
/// client processes the roster; retained across reconnects; destroyed with
/// the session.
pub(crate) struct Neighbor {
    pub username: String,
    pub ip: IpAddr,
    pub server_port: u16,
    /// Key for traffic we send to this peer
    pub send_key: SymmetricKey,
    /// Key for traffic this peer sends to us
    pub receive_key: SymmetricKey,
    pub dialer: TlsDialer,
    /// Resolves true once the dialer's TLS handshake completes
    pub ready_tx: watch::Sender<bool>,
    pub ready_rx: watch::Receiver<bool>,
    /// Dialer-side TCP closed
    pub disconnected: bool,
    /// Dialer-side heartbeat timeout
    pub soft_disconnected: bool,
    /// Listener-side heartbeat timeout for this peer
    pub server_soft_disconnected: bool,
    /// A re-handshake is in flight; at most one per neighbor
    pub rebuilding_socket: bool,
    /// Remote port last seen on our listener from this peer's address
    pub listener_port: Option<u16>,
}

impl Neighbor {
    pub fn new(
        username: &str,
        ip: IpAddr,
        server_port: u16,
        send_key: SymmetricKey,
        receive_key: SymmetricKey,
        events: TaggedEventTx,
    ) -> Self {
        let dialer = TlsDialer::new(
            DialerConfig {
                tag: username.to_string(),
                expected_name: username.to_string(),
                keep_alive: true,
            },
            events,
        );
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            username: username.to_string(),
            ip,
            server_port,
            send_key,
            receive_key,
            dialer,
            ready_tx,
            ready_rx,
            disconnected: false,
            soft_disconnected: false,
            server_soft_disconnected: false,
            rebuilding_socket: false,
            listener_port: None,
        }
    }

    /// No flag set in either direction
    pub fn healthy(&self) -> bool {
        !self.disconnected && !self.soft_disconnected && !self.server_soft_disconnected
    }

    /// Already considered down from the dialer's perspective
    pub fn down(&self) -> bool {
        self.disconnected || self.soft_disconnected
    }
}
