//! Host Node
//!
//! Built from the coordinator's exported roster. `start` dials every member
//! eagerly, then delivers the roster to each one encrypted under that
//! member's SRP key (the only key the member knows at that moment). The
//! session counts as started once every member has acknowledged.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tracing::warn;

use lanmesh_crypto::RsaKeyMaterial;

use super::mesh::{send_to_peer, spawn_dial, MeshNode, RoleRuntime};
use super::neighbor::Neighbor;
use crate::coordinator::AuthenticatedMember;
use crate::error::SessionResult;
use crate::events::NodeEvent;
use crate::wire::{EnvelopeKind, RosterEntry, RosterPayload};

pub struct HostNode {
    node: MeshNode,
}

impl HostNode {
    /// Create the host node and install one neighbor per authenticated
    /// member. The host's per-pair keys are the SRP session keys, identical
    /// in both directions.
    pub async fn new(
        identifier: &str,
        node_port: u16,
        keypair: RsaKeyMaterial,
        members: &[AuthenticatedMember],
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> SessionResult<Self> {
        let node = MeshNode::new(
            identifier,
            node_port,
            keypair,
            events,
            RoleRuntime::Host {
                acked: HashSet::new(),
                started: false,
            },
        )
        .await?;

        {
            let mut neighbors = node.shared.neighbors.write().await;
            for member in members {
                neighbors.insert(
                    member.user_name.clone(),
                    Neighbor::new(
                        &member.user_name,
                        member.ip,
                        member.node_port,
                        member.session_key.clone(),
                        member.session_key.clone(),
                        node.shared.dialer_events.clone(),
                    ),
                );
            }
        }
        Ok(Self { node })
    }

    /// Begin mesh formation: dial everyone, then hand out the roster
    pub async fn start(&self) -> SessionResult<()> {
        let shared = &self.node.shared;
        let (users, rows) = {
            let neighbors = shared.neighbors.read().await;
            let users: Vec<String> = neighbors.keys().cloned().collect();
            let rows: Vec<RosterEntry> = neighbors
                .values()
                .map(|n| RosterEntry {
                    username: n.username.clone(),
                    ip: n.ip.to_string(),
                    port: n.server_port,
                    send_key: n.send_key.to_hex(),
                    receive_key: n.receive_key.to_hex(),
                })
                .collect();
            (users, rows)
        };

        // eager dials; failures land in the reconnect path
        for user in &users {
            spawn_dial(shared.clone(), user.clone());
        }

        let payload = serde_json::to_vec(&RosterPayload { nodes: rows })?;
        for user in users {
            let hello_shared = shared.clone();
            let hello_payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    send_to_peer(&hello_shared, &user, EnvelopeKind::Hello, hello_payload).await
                {
                    warn!(user = %user, "failed to deliver roster: {e}");
                }
            });
        }
        Ok(())
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
