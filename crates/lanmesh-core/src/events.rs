//! Typed Event Sums
//!
//! Each component reports through a closed sum of events dispatched over
//! channels; the session façade folds them into [`SessionEvent`] on a
//! broadcast channel for subscribers.

use std::net::IpAddr;

/// Events emitted by the coordinator server (host side)
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// A candidate began the SRP handshake
    ConnectionAttempt { username: String, ip: IpAddr },
    /// A handshake round was rejected
    ConnectionAttemptFail {
        username: String,
        ip: IpAddr,
        error: String,
    },
    /// A member completed authentication
    Connected { username: String },
}

/// Events emitted by the coordinator client (joining side)
#[derive(Debug, Clone)]
pub enum CoordinatorClientEvent {
    /// TLS tunnel to the coordinator is up
    Connected,
    /// SRP handshake completed and the endpoint payload decrypted
    Authenticated,
    /// The coordinator answered with an error status
    Error(String),
}

/// Events emitted by a mesh node
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The mesh bootstrap completed (fires exactly once per mesh)
    SessionStarted,
    /// A pairwise channel finished its TLS handshake
    PeerConnected(String),
    /// A pairwise channel went down (hard or soft)
    PeerDisconnected(String),
    /// A soft-disconnected channel resumed
    PeerReconnected(String),
    /// An application message arrived
    Message {
        from: String,
        text: String,
        broadcast: bool,
    },
    /// AES encrypt/decrypt failed; the message was dropped
    EncryptError {
        fn_name: &'static str,
        username: String,
        message_type: String,
    },
}

/// Session-level events observed by façade subscribers
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session is advertised and accepting members (host)
    Advertised,
    /// A candidate began authenticating (host)
    ConnectionAttempt { username: String, ip: IpAddr },
    /// A handshake round was rejected (host)
    ConnectionAttemptFail {
        username: String,
        ip: IpAddr,
        error: String,
    },
    /// A member completed authentication (host)
    MemberAuthenticated { username: String },
    /// TLS tunnel to the coordinator is up (client)
    CoordinatorConnected,
    /// SRP handshake completed (client)
    Authenticated,
    /// The coordinator rejected the handshake (client)
    CoordinatorError(String),
    /// The mesh bootstrap completed
    SessionStarted,
    /// An application message arrived
    Message {
        from: String,
        text: String,
        broadcast: bool,
    },
    /// A pairwise channel came up
    PeerConnected(String),
    /// A pairwise channel went down
    PeerDisconnected(String),
    /// A pairwise channel recovered
    PeerReconnected(String),
    /// Discovery collaborator error
    DiscoveryError(String),
    /// AES failure on a mesh message
    EncryptError {
        fn_name: &'static str,
        username: String,
        message_type: String,
    },
}
