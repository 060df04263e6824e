//! End-to-end session scenarios through the façade: discovery, SRP
//! authentication, mesh start, and message delivery; plus the bad-passcode
//! rejection path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use lanmesh_core::{
    Client, Host, LanRegistry, SessionConfig, SessionError, SessionEvent,
};

const WAIT: Duration = Duration::from_secs(30);

fn config(identifier: &str) -> SessionConfig {
    SessionConfig {
        identifier: Some(identifier.to_string()),
        ..SessionConfig::default()
    }
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F)
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if pred(&event) {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("event channel closed while waiting")
                }
            }
        }
    })
    .await
    .expect("timed out waiting for session event");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn passcode_session_end_to_end() {
    let registry = Arc::new(LanRegistry::new());

    let mut host = Host::create(config("blorp-glork"), registry.clone())
        .await
        .unwrap();
    let mut host_events = host.subscribe();
    host.advertise().await.unwrap();
    let passcode = host.passcode().to_string();

    // joining with the right passcode lands in the roster
    let mut client = Client::create(config("frulf"), registry.clone())
        .await
        .unwrap();
    let mut client_events = client.subscribe();
    client
        .connect_session("blorp-glork", &passcode)
        .await
        .unwrap();

    let members = host.authenticated_members().await;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].user_name, "frulf");
    assert_eq!(members[0].session_key_hex().len(), 64);

    // a wrong passcode is rejected and leaves the roster untouched
    let wrong = if passcode == "000000" { "111111" } else { "000000" };
    let mut intruder = Client::create(config("grinch"), registry.clone())
        .await
        .unwrap();
    let result = intruder.connect_session("blorp-glork", wrong).await;
    match result {
        Err(SessionError::CoordinatorAuth(message)) => {
            assert!(message.contains("Unable to verify client"), "got: {message}");
        }
        other => panic!("expected coordinator rejection, got {other:?}"),
    }
    assert_eq!(host.authenticated_members().await.len(), 1);
    intruder.destroy().await;

    // mesh formation and message flow
    host.start_mesh().await.unwrap();
    wait_for(&mut host_events, |e| {
        matches!(e, SessionEvent::SessionStarted)
    })
    .await;
    wait_for(&mut client_events, |e| {
        matches!(e, SessionEvent::SessionStarted)
    })
    .await;

    client.broadcast("hi").await.unwrap();
    wait_for(&mut host_events, |e| {
        matches!(e, SessionEvent::Message { from, text, .. } if from == "frulf" && text == "hi")
    })
    .await;

    host.send("frulf", "welcome").await.unwrap();
    wait_for(&mut client_events, |e| {
        matches!(
            e,
            SessionEvent::Message { from, text, broadcast: false }
                if from == "blorp-glork" && text == "welcome"
        )
    })
    .await;

    host.destroy().await;
    client.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_username_is_rejected() {
    let registry = Arc::new(LanRegistry::new());

    let mut host = Host::create(config("quiet-session"), registry.clone())
        .await
        .unwrap();
    host.advertise().await.unwrap();
    let passcode = host.passcode().to_string();

    let mut first = Client::create(config("dup"), registry.clone()).await.unwrap();
    first
        .connect_session("quiet-session", &passcode)
        .await
        .unwrap();

    // same username, same address: re-registration replaces the entry
    // rather than producing a duplicate roster row
    let mut second = Client::create(config("dup"), registry.clone()).await.unwrap();
    let _ = second.connect_session("quiet-session", &passcode).await;

    let members = host.authenticated_members().await;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].user_name, "dup");

    host.destroy().await;
    first.destroy().await;
    second.destroy().await;
}
