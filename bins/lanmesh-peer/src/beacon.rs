//! UDP Beacon Discovery
//!
//! A minimal LAN discovery collaborator for the demo binary: hosts answer
//! broadcast queries on a well-known UDP port with their announcement, and
//! browsers poll with broadcast queries. Real deployments would plug a
//! DNS-SD daemon into the same [`Discovery`] contract instead.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use lanmesh_core::{Discovery, DiscoveryEvent, ResolvedService, ServiceAd};

/// Well-known UDP port the beacon responder listens on
pub const BEACON_PORT: u16 = 53530;

const QUERY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum BeaconMessage {
    Query,
    Announce {
        name: String,
        port: u16,
        txt: HashMap<String, String>,
    },
}

/// UDP-broadcast implementation of the discovery contract
#[derive(Default)]
pub struct LanBeacon {
    responder: Mutex<Option<(String, JoinHandle<()>)>>,
    browsers: Mutex<Vec<JoinHandle<()>>>,
}

impl LanBeacon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Drop for LanBeacon {
    fn drop(&mut self) {
        if let Some((_, task)) = self.responder.lock().unwrap().take() {
            task.abort();
        }
        for task in self.browsers.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

async fn run_responder(ad: ServiceAd) {
    let socket = match UdpSocket::bind(("0.0.0.0", BEACON_PORT)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("beacon responder failed to bind: {e}");
            return;
        }
    };
    let mut buf = [0u8; 2048];
    loop {
        let Ok((n, from)) = socket.recv_from(&mut buf).await else {
            continue;
        };
        if !matches!(
            serde_json::from_slice::<BeaconMessage>(&buf[..n]),
            Ok(BeaconMessage::Query)
        ) {
            continue;
        }
        debug!(%from, "answering beacon query");
        let announce = BeaconMessage::Announce {
            name: ad.instance.clone(),
            port: ad.port,
            txt: ad.txt.clone(),
        };
        if let Ok(bytes) = serde_json::to_vec(&announce) {
            let _ = socket.send_to(&bytes, from).await;
        }
    }
}

async fn run_browser(events: mpsc::UnboundedSender<DiscoveryEvent>) {
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            let _ = events.send(DiscoveryEvent::Error(e.to_string()));
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        let _ = events.send(DiscoveryEvent::Error(e.to_string()));
        return;
    }

    let query = serde_json::to_vec(&BeaconMessage::Query).expect("static message serializes");
    let targets: [SocketAddr; 2] = [
        (IpAddr::from([255, 255, 255, 255]), BEACON_PORT).into(),
        (IpAddr::from([127, 0, 0, 1]), BEACON_PORT).into(),
    ];
    let mut buf = [0u8; 2048];
    let mut ticker = tokio::time::interval(QUERY_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for target in targets {
                    let _ = socket.send_to(&query, target).await;
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let Ok((n, from)) = recv else { continue };
                let Ok(BeaconMessage::Announce { name, port, txt }) =
                    serde_json::from_slice::<BeaconMessage>(&buf[..n])
                else {
                    continue;
                };
                let resolved = ResolvedService {
                    name,
                    addresses: vec![from.ip()],
                    port,
                    txt,
                };
                if events.send(DiscoveryEvent::Resolved(resolved)).is_err() {
                    return;
                }
            }
        }
    }
}

impl Discovery for LanBeacon {
    fn publish(&self, ad: ServiceAd) -> Result<(), String> {
        let mut responder = self.responder.lock().unwrap();
        if let Some((_, task)) = responder.take() {
            task.abort();
        }
        let instance = ad.instance.clone();
        let task = tokio::spawn(run_responder(ad));
        *responder = Some((instance, task));
        Ok(())
    }

    fn unpublish(&self, instance: &str) {
        let mut responder = self.responder.lock().unwrap();
        if let Some((name, task)) = responder.take() {
            if name == instance {
                task.abort();
            } else {
                *responder = Some((name, task));
            }
        }
    }

    fn browse(&self) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.browsers.lock().unwrap().push(tokio::spawn(run_browser(tx)));
        rx
    }
}
