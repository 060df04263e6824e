//! Client Node
//!
//! Built from the decrypted coordinator payload: the host's node endpoint
//! plus the SRP-shared key. Starts with the host as its only neighbor,
//! installs the rest of the mesh from the host's `hello` roster, and
//! acknowledges with `ack-hello`.

use tokio::sync::mpsc;

use lanmesh_crypto::RsaKeyMaterial;

use super::mesh::{spawn_dial, MeshNode, RoleRuntime};
use super::neighbor::Neighbor;
use crate::coordinator::CoordinatorTicket;
use crate::error::SessionResult;
use crate::events::NodeEvent;

pub struct ClientNode {
    node: MeshNode,
}

impl ClientNode {
    /// Create the client node and eagerly dial the host
    pub async fn new(
        identifier: &str,
        node_port: u16,
        keypair: RsaKeyMaterial,
        ticket: CoordinatorTicket,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> SessionResult<Self> {
        let node = MeshNode::new(
            identifier,
            node_port,
            keypair,
            events,
            RoleRuntime::Client {
                host_name: ticket.host_name.clone(),
                hello_done: false,
                started: false,
            },
        )
        .await?;

        {
            let mut neighbors = node.shared.neighbors.write().await;
            neighbors.insert(
                ticket.host_name.clone(),
                Neighbor::new(
                    &ticket.host_name,
                    ticket.host_ip,
                    ticket.host_node_port,
                    ticket.key.clone(),
                    ticket.key.clone(),
                    node.shared.dialer_events.clone(),
                ),
            );
        }
        spawn_dial(node.shared.clone(), ticket.host_name);
        Ok(Self { node })
    }

    pub async fn send_message(&self, user: &str, text: &str) -> SessionResult<()> {
        self.node.send_message(user, text).await
    }

    pub async fn broadcast_message(&self, text: &str) {
        self.node.broadcast_message(text).await
    }

    pub async fn neighbor_names(&self) -> Vec<String> {
        self.node.neighbor_names().await
    }

    pub async fn neighbor_keys(&self, user: &str) -> Option<(String, String)> {
        self.node.neighbor_keys(user).await
    }

    pub async fn destroy(&self) {
        self.node.destroy().await
    }
}
