//! Three-node mesh formation over loopback TCP.
//!
//! Builds a host and two clients directly from fabricated coordinator
//! results, then checks mesh completeness, the per-pair key assignment, the
//! single `session-started` emission, and message delivery across a
//! client-to-client channel that only exists because of the roster.

use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use lanmesh_core::coordinator::{AuthenticatedMember, CoordinatorTicket};
use lanmesh_core::events::NodeEvent;
use lanmesh_core::node::{ClientNode, HostNode};
use lanmesh_crypto::{generate_rsa_key, SymmetricKey};
use lanmesh_network::open_port;

const WAIT: Duration = Duration::from_secs(20);

async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<NodeEvent>, mut pred: F)
where
    F: FnMut(&NodeEvent) -> bool,
{
    timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return;
            }
        }
        panic!("event channel closed while waiting");
    })
    .await
    .expect("timed out waiting for node event");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_mesh_forms_and_delivers() {
    let localhost: IpAddr = "127.0.0.1".parse().unwrap();

    let host_port = open_port(None).await.unwrap();
    let c1_port = open_port(None).await.unwrap();
    let c2_port = open_port(None).await.unwrap();

    let host_rsa = generate_rsa_key().await.unwrap();
    let c1_rsa = generate_rsa_key().await.unwrap();
    let c2_rsa = generate_rsa_key().await.unwrap();

    // stand-ins for the SRP-derived per-member keys
    let c1_key = SymmetricKey::generate();
    let c2_key = SymmetricKey::generate();

    let members = vec![
        AuthenticatedMember {
            user_name: "C1".into(),
            ip: localhost,
            node_port: c1_port,
            session_key: c1_key.clone(),
        },
        AuthenticatedMember {
            user_name: "C2".into(),
            ip: localhost,
            node_port: c2_port,
            session_key: c2_key.clone(),
        },
    ];

    let (host_tx, mut host_rx) = mpsc::unbounded_channel();
    let host = HostNode::new("blorp-glork", host_port, host_rsa, &members, host_tx)
        .await
        .unwrap();

    let (c1_tx, mut c1_rx) = mpsc::unbounded_channel();
    let c1 = ClientNode::new(
        "C1",
        c1_port,
        c1_rsa,
        CoordinatorTicket {
            host_name: "blorp-glork".into(),
            host_ip: localhost,
            host_node_port: host_port,
            key: c1_key.clone(),
        },
        c1_tx,
    )
    .await
    .unwrap();

    let (c2_tx, mut c2_rx) = mpsc::unbounded_channel();
    let c2 = ClientNode::new(
        "C2",
        c2_port,
        c2_rsa,
        CoordinatorTicket {
            host_name: "blorp-glork".into(),
            host_ip: localhost,
            host_node_port: host_port,
            key: c2_key.clone(),
        },
        c2_tx,
    )
    .await
    .unwrap();

    host.start().await.unwrap();

    wait_for(&mut host_rx, |e| matches!(e, NodeEvent::SessionStarted)).await;
    wait_for(&mut c1_rx, |e| matches!(e, NodeEvent::SessionStarted)).await;
    wait_for(&mut c2_rx, |e| matches!(e, NodeEvent::SessionStarted)).await;

    // mesh completeness: every member has N-1 neighbors
    let mut host_neighbors = host.neighbor_names().await;
    host_neighbors.sort();
    assert_eq!(host_neighbors, vec!["C1".to_string(), "C2".to_string()]);
    assert_eq!(c1.neighbor_names().await.len(), 2);
    assert_eq!(c2.neighbor_names().await.len(), 2);

    // key symmetry across every pair: A's sendKey equals B's receiveKey
    let pairs = [
        (
            host.neighbor_keys("C1").await.unwrap(),
            c1.neighbor_keys("blorp-glork").await.unwrap(),
        ),
        (
            host.neighbor_keys("C2").await.unwrap(),
            c2.neighbor_keys("blorp-glork").await.unwrap(),
        ),
        (
            c1.neighbor_keys("C2").await.unwrap(),
            c2.neighbor_keys("C1").await.unwrap(),
        ),
    ];
    for ((a_send, a_recv), (b_send, b_recv)) in pairs {
        assert_eq!(a_send, b_recv);
        assert_eq!(b_send, a_recv);
    }

    // client-to-client delivery over the roster-created channel
    c1.send_message("C2", "hi").await.unwrap();
    wait_for(&mut c2_rx, |e| {
        matches!(
            e,
            NodeEvent::Message { from, text, broadcast: false }
                if from == "C1" && text == "hi"
        )
    })
    .await;

    // host broadcast reaches both clients
    host.broadcast_message("round").await;
    wait_for(&mut c1_rx, |e| {
        matches!(e, NodeEvent::Message { from, text, broadcast: true } if from == "blorp-glork" && text == "round")
    })
    .await;
    wait_for(&mut c2_rx, |e| {
        matches!(e, NodeEvent::Message { from, text, broadcast: true } if from == "blorp-glork" && text == "round")
    })
    .await;

    // session-started fires exactly once on the host
    let extra_started = async {
        let mut count = 0;
        while let Ok(Some(event)) =
            timeout(Duration::from_secs(3), host_rx.recv()).await
        {
            if matches!(event, NodeEvent::SessionStarted) {
                count += 1;
            }
        }
        count
    }
    .await;
    assert_eq!(extra_started, 0);

    host.destroy().await;
    c1.destroy().await;
    c2.destroy().await;
}
