//! Discovery Collaborator
//!
//! The mDNS/DNS-SD publisher and browser live outside the core; this module
//! names their contract. The TXT record carries the coordinator port, while
//! the advertised service port is the discovery port. Browsers hand back
//! resolved IPv4 addresses; IPv6 is ignored.
//!
//! [`LanRegistry`] is an in-process implementation of the contract used by
//! tests and the demo binary, so the core can run without a platform mDNS
//! daemon.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

/// DNS-SD service type for lanmesh sessions
pub const SERVICE_TYPE: &str = "_lanmesh._tcp";

/// DNS-SD domain
pub const DEFAULT_DOMAIN: &str = "local.";

/// TXT record key carrying the coordinator port
pub const TXT_COORDINATOR_PORT: &str = "coordinatorPort";

/// First port probed for the discovery listener
pub const DEFAULT_DISCOVERY_PORT: u16 = 5330;

/// A service announcement to publish
#[derive(Debug, Clone)]
pub struct ServiceAd {
    pub instance: String,
    pub service_type: String,
    pub protocol: String,
    pub domain: String,
    /// The discovery port; the coordinator port travels in the TXT record
    pub port: u16,
    pub txt: HashMap<String, String>,
}

impl ServiceAd {
    pub fn new(instance: &str, discovery_port: u16, coordinator_port: u16) -> Self {
        let mut txt = HashMap::new();
        txt.insert(TXT_COORDINATOR_PORT.to_string(), coordinator_port.to_string());
        Self {
            instance: instance.to_string(),
            service_type: SERVICE_TYPE.to_string(),
            protocol: "tcp".to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            port: discovery_port,
            txt,
        }
    }
}

/// A service instance surfaced by the browser
#[derive(Debug, Clone)]
pub struct ResolvedService {
    pub name: String,
    pub addresses: Vec<IpAddr>,
    /// The advertised (discovery) port; not the coordinator port
    pub port: u16,
    pub txt: HashMap<String, String>,
}

impl ResolvedService {
    /// First usable IPv4 address. Non-loopback addresses win; loopback is
    /// accepted only as a same-machine fallback.
    pub fn ipv4_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|a| a.is_ipv4() && !a.is_loopback())
            .or_else(|| self.addresses.iter().find(|a| a.is_ipv4()))
            .copied()
    }

    /// Coordinator port from the TXT record
    pub fn coordinator_port(&self) -> Option<u16> {
        self.txt.get(TXT_COORDINATOR_PORT)?.parse().ok()
    }
}

/// Browser-side events
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Published { name: String },
    Resolved(ResolvedService),
    Removed { name: String },
    Error(String),
}

/// The collaborator contract the session façade composes against
pub trait Discovery: Send + Sync {
    /// Announce a session; errors are collaborator-specific strings
    fn publish(&self, ad: ServiceAd) -> Result<(), String>;

    /// Withdraw an announcement
    fn unpublish(&self, instance: &str);

    /// Start browsing; existing and future instances arrive as events
    fn browse(&self) -> mpsc::UnboundedReceiver<DiscoveryEvent>;
}

/// Best-effort local IPv4 via the routing table; no packets are sent
pub fn local_ipv4() -> IpAddr {
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        if socket.connect(("8.8.8.8", 80)).is_ok() {
            if let Ok(addr) = socket.local_addr() {
                if !addr.ip().is_loopback() {
                    return addr.ip();
                }
            }
        }
    }
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[derive(Default)]
struct RegistryInner {
    services: HashMap<String, ResolvedService>,
    watchers: Vec<mpsc::UnboundedSender<DiscoveryEvent>>,
}

/// In-process registry implementing the discovery contract
#[derive(Clone, Default)]
pub struct LanRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl LanRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Discovery for LanRegistry {
    fn publish(&self, ad: ServiceAd) -> Result<(), String> {
        let service = ResolvedService {
            name: ad.instance.clone(),
            addresses: vec![local_ipv4()],
            port: ad.port,
            txt: ad.txt,
        };
        debug!(name = %service.name, "registry publish");
        let mut inner = self.inner.lock().unwrap();
        inner.services.insert(service.name.clone(), service.clone());
        inner
            .watchers
            .retain(|w| w.send(DiscoveryEvent::Resolved(service.clone())).is_ok());
        Ok(())
    }

    fn unpublish(&self, instance: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.services.remove(instance).is_some() {
            let name = instance.to_string();
            inner
                .watchers
                .retain(|w| w.send(DiscoveryEvent::Removed { name: name.clone() }).is_ok());
        }
    }

    fn browse(&self) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        for service in inner.services.values() {
            let _ = tx.send(DiscoveryEvent::Resolved(service.clone()));
        }
        inner.watchers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_announces_existing_and_new() {
        let registry = LanRegistry::new();
        registry
            .publish(ServiceAd::new("blorp-glork", 5330, 50001))
            .unwrap();

        let mut browser = registry.browse();
        match browser.recv().await.unwrap() {
            DiscoveryEvent::Resolved(s) => {
                assert_eq!(s.name, "blorp-glork");
                assert_eq!(s.coordinator_port(), Some(50001));
            }
            other => panic!("unexpected event {other:?}"),
        }

        registry
            .publish(ServiceAd::new("frulf", 5331, 50002))
            .unwrap();
        match browser.recv().await.unwrap() {
            DiscoveryEvent::Resolved(s) => assert_eq!(s.name, "frulf"),
            other => panic!("unexpected event {other:?}"),
        }

        registry.unpublish("frulf");
        match browser.recv().await.unwrap() {
            DiscoveryEvent::Removed { name } => assert_eq!(name, "frulf"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_address_filter_prefers_non_loopback() {
        let service = ResolvedService {
            name: "s".into(),
            addresses: vec![
                "127.0.0.1".parse().unwrap(),
                "192.168.1.7".parse().unwrap(),
            ],
            port: 5330,
            txt: HashMap::new(),
        };
        assert_eq!(
            service.ipv4_address(),
            Some("192.168.1.7".parse().unwrap())
        );

        let loopback_only = ResolvedService {
            name: "s".into(),
            addresses: vec!["127.0.0.1".parse().unwrap()],
            port: 5330,
            txt: HashMap::new(),
        };
        assert_eq!(
            loopback_only.ipv4_address(),
            Some("127.0.0.1".parse().unwrap())
        );
    }
}
