//! Session Façade
//!
//! [`Host`] and [`Client`] compose discovery, coordinator, and node. Each
//! process owns an identifier (random mnemonic unless supplied), two RSA
//! keypairs (coordinator and node certificates), and three probed ports.
//! Component events are folded onto one broadcast channel of
//! [`SessionEvent`]s.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

use lanmesh_crypto::{generate_passcode, generate_rsa_key, mnemonic, RsaKeyMaterial};
use lanmesh_network::open_port;

use crate::coordinator::{
    authenticate, AuthenticatedMember, CoordinatorClientConfig, CoordinatorConfig,
    CoordinatorServer,
};
use crate::discovery::{Discovery, DiscoveryEvent, ServiceAd, DEFAULT_DISCOVERY_PORT};
use crate::error::{SessionError, SessionResult};
use crate::events::{CoordinatorClientEvent, CoordinatorEvent, NodeEvent, SessionEvent};
use crate::node::{ClientNode, HostNode};

/// Construction options shared by hosts and clients
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Mnemonic identifier; random when absent
    pub identifier: Option<String>,
    /// First port probed for the discovery listener
    pub discovery_port_hint: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identifier: None,
            discovery_port_hint: DEFAULT_DISCOVERY_PORT,
        }
    }
}

/// State common to both roles
struct P2PSession {
    identifier: String,
    discovery_port: u16,
    coordinator_port: u16,
    node_port: u16,
    coordinator_key: RsaKeyMaterial,
    node_key: RsaKeyMaterial,
    events: broadcast::Sender<SessionEvent>,
}

impl P2PSession {
    async fn create(config: SessionConfig) -> SessionResult<Self> {
        let identifier = config.identifier.unwrap_or_else(mnemonic);
        // keygen runs on blocking workers; both keys generate concurrently
        let (coordinator_key, node_key) = tokio::try_join!(generate_rsa_key(), generate_rsa_key())?;
        let discovery_port = open_port(Some(config.discovery_port_hint)).await?;
        let coordinator_port = open_port(None).await?;
        let node_port = open_port(None).await?;
        let (events, _) = broadcast::channel(256);

        info!(
            identifier = %identifier,
            discovery_port,
            coordinator_port,
            node_port,
            "session created"
        );
        Ok(Self {
            identifier,
            discovery_port,
            coordinator_port,
            node_port,
            coordinator_key,
            node_key,
            events,
        })
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

fn spawn_node_forwarder(
    mut rx: mpsc::UnboundedReceiver<NodeEvent>,
    events: broadcast::Sender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let mapped = match event {
                NodeEvent::SessionStarted => SessionEvent::SessionStarted,
                NodeEvent::PeerConnected(user) => SessionEvent::PeerConnected(user),
                NodeEvent::PeerDisconnected(user) => SessionEvent::PeerDisconnected(user),
                NodeEvent::PeerReconnected(user) => SessionEvent::PeerReconnected(user),
                NodeEvent::Message {
                    from,
                    text,
                    broadcast,
                } => SessionEvent::Message {
                    from,
                    text,
                    broadcast,
                },
                NodeEvent::EncryptError {
                    fn_name,
                    username,
                    message_type,
                } => SessionEvent::EncryptError {
                    fn_name,
                    username,
                    message_type,
                },
            };
            let _ = events.send(mapped);
        }
    })
}

/// The hosting side: advertises, authenticates members, starts the mesh
pub struct Host {
    session: P2PSession,
    passcode: String,
    discovery: Arc<dyn Discovery>,
    coordinator: Option<CoordinatorServer>,
    node: Option<HostNode>,
    forwarders: Vec<JoinHandle<()>>,
}

impl Host {
    /// Generate identity and keys, probe ports. Rejects on port exhaustion
    /// or key-generation failure.
    pub async fn create(
        config: SessionConfig,
        discovery: Arc<dyn Discovery>,
    ) -> SessionResult<Self> {
        let session = P2PSession::create(config).await?;
        Ok(Self {
            session,
            passcode: generate_passcode(),
            discovery,
            coordinator: None,
            node: None,
            forwarders: Vec::new(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.session.identifier
    }

    /// The six-digit passcode to share out of band
    pub fn passcode(&self) -> &str {
        &self.passcode
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.events.subscribe()
    }

    /// Start the coordinator and announce the session
    pub async fn advertise(&mut self) -> SessionResult<()> {
        if self.coordinator.is_some() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = self.session.events.clone();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mapped = match event {
                    CoordinatorEvent::ConnectionAttempt { username, ip } => {
                        SessionEvent::ConnectionAttempt { username, ip }
                    }
                    CoordinatorEvent::ConnectionAttemptFail {
                        username,
                        ip,
                        error,
                    } => SessionEvent::ConnectionAttemptFail {
                        username,
                        ip,
                        error,
                    },
                    CoordinatorEvent::Connected { username } => {
                        SessionEvent::MemberAuthenticated { username }
                    }
                };
                let _ = events.send(mapped);
            }
        }));

        let server = CoordinatorServer::start(
            CoordinatorConfig {
                session_name: self.session.identifier.clone(),
                passcode: self.passcode.clone(),
                port: self.session.coordinator_port,
                host_node_port: self.session.node_port,
            },
            &self.session.coordinator_key,
            tx,
        )
        .await?;
        self.coordinator = Some(server);

        self.discovery
            .publish(ServiceAd::new(
                &self.session.identifier,
                self.session.discovery_port,
                self.session.coordinator_port,
            ))
            .map_err(SessionError::Discovery)?;

        info!(session = %self.session.identifier, "session advertised");
        self.session.emit(SessionEvent::Advertised);
        Ok(())
    }

    /// Members that completed SRP so far
    pub async fn authenticated_members(&self) -> Vec<AuthenticatedMember> {
        match &self.coordinator {
            Some(coordinator) => coordinator.export_users().await,
            None => Vec::new(),
        }
    }

    /// Stop authenticating and form the mesh from the current roster
    pub async fn start_mesh(&mut self) -> SessionResult<()> {
        let coordinator = self
            .coordinator
            .take()
            .ok_or_else(|| SessionError::Protocol("no active coordinator".into()))?;
        let members = coordinator.export_users().await;
        coordinator.stop().await;
        self.discovery.unpublish(&self.session.identifier);

        let (tx, rx) = mpsc::unbounded_channel();
        self.forwarders
            .push(spawn_node_forwarder(rx, self.session.events.clone()));
        let node = HostNode::new(
            &self.session.identifier,
            self.session.node_port,
            self.session.node_key.clone(),
            &members,
            tx,
        )
        .await?;
        node.start().await?;
        self.node = Some(node);
        info!(members = members.len(), "mesh bootstrap underway");
        Ok(())
    }

    /// Unicast to one member of the running mesh
    pub async fn send(&self, user: &str, text: &str) -> SessionResult<()> {
        self.node
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("mesh not started".into()))?
            .send_message(user, text)
            .await
    }

    /// Broadcast to every member of the running mesh
    pub async fn broadcast(&self, text: &str) -> SessionResult<()> {
        self.node
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("mesh not started".into()))?
            .broadcast_message(text)
            .await;
        Ok(())
    }

    /// The running mesh node, if the mesh has started
    pub fn node(&self) -> Option<&HostNode> {
        self.node.as_ref()
    }

    /// Tear down everything. Idempotent.
    pub async fn destroy(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.stop().await;
        }
        if let Some(node) = self.node.take() {
            node.destroy().await;
        }
        self.discovery.unpublish(&self.session.identifier);
        for task in self.forwarders.drain(..) {
            task.abort();
        }
    }
}

/// The joining side: discovers a session, authenticates, joins the mesh
pub struct Client {
    session: P2PSession,
    discovery: Arc<dyn Discovery>,
    node: Option<ClientNode>,
    forwarders: Vec<JoinHandle<()>>,
}

impl Client {
    pub async fn create(
        config: SessionConfig,
        discovery: Arc<dyn Discovery>,
    ) -> SessionResult<Self> {
        let session = P2PSession::create(config).await?;
        Ok(Self {
            session,
            discovery,
            node: None,
            forwarders: Vec::new(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.session.identifier
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.events.subscribe()
    }

    /// Find the named session, authenticate with the passcode, and join.
    /// Resolves once the coordinator handshake completes; the mesh forms in
    /// the background and surfaces `SessionStarted`.
    pub async fn connect_session(
        &mut self,
        session_name: &str,
        passcode: &str,
    ) -> SessionResult<()> {
        let mut browser = self.discovery.browse();
        let service = loop {
            match browser.recv().await {
                Some(DiscoveryEvent::Resolved(service)) if service.name == session_name => {
                    break service
                }
                Some(DiscoveryEvent::Error(e)) => {
                    self.session.emit(SessionEvent::DiscoveryError(e));
                }
                Some(_) => {}
                None => {
                    return Err(SessionError::Discovery(
                        "browser closed before the session was found".into(),
                    ))
                }
            }
        };
        let host_ip = service.ipv4_address().ok_or_else(|| {
            SessionError::Discovery(format!("no usable address for '{session_name}'"))
        })?;
        let coordinator_port = service.coordinator_port().ok_or_else(|| {
            SessionError::Discovery("announcement is missing coordinatorPort".into())
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = self.session.events.clone();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mapped = match event {
                    CoordinatorClientEvent::Connected => SessionEvent::CoordinatorConnected,
                    CoordinatorClientEvent::Authenticated => SessionEvent::Authenticated,
                    CoordinatorClientEvent::Error(e) => SessionEvent::CoordinatorError(e),
                };
                let _ = events.send(mapped);
            }
        }));

        let ticket = authenticate(
            CoordinatorClientConfig {
                identifier: self.session.identifier.clone(),
                session_name: session_name.to_string(),
                passcode: passcode.to_string(),
                node_port: self.session.node_port,
            },
            host_ip,
            coordinator_port,
            tx,
        )
        .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.forwarders
            .push(spawn_node_forwarder(rx, self.session.events.clone()));
        let node = ClientNode::new(
            &self.session.identifier,
            self.session.node_port,
            self.session.node_key.clone(),
            ticket,
            tx,
        )
        .await?;
        self.node = Some(node);
        Ok(())
    }

    /// Unicast to one member of the running mesh
    pub async fn send(&self, user: &str, text: &str) -> SessionResult<()> {
        self.node
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("not joined to a session".into()))?
            .send_message(user, text)
            .await
    }

    /// Broadcast to every member of the running mesh
    pub async fn broadcast(&self, text: &str) -> SessionResult<()> {
        self.node
            .as_ref()
            .ok_or_else(|| SessionError::Protocol("not joined to a session".into()))?
            .broadcast_message(text)
            .await;
        Ok(())
    }

    /// The running mesh node, if joined
    pub fn node(&self) -> Option<&ClientNode> {
        self.node.as_ref()
    }

    /// Tear down everything. Idempotent.
    pub async fn destroy(&mut self) {
        if let Some(node) = self.node.take() {
            node.destroy().await;
        }
        for task in self.forwarders.drain(..) {
            task.abort();
        }
    }
}
