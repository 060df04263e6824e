//! Heartbeat Liveness Protocol
//!
//! Each keep-alive channel probes its peer with random 16-byte challenges.
//! A cycle: wait one interval, send the challenge, then demand the matching
//! echo within one timeout. Silence moves the channel to soft-disconnected
//! and keeps probing; the next matching echo restores it. A response only
//! counts if its payload equals the most recently sent challenge.

use std::time::Duration;

use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::framing::Frame;

/// Delay before each challenge is sent
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Deadline for the matching echo after a challenge goes out
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(1000);

const CHALLENGE_SIZE: usize = 16;

/// Liveness transitions observed by the channel owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// The peer missed a challenge deadline (soft disconnect)
    Disconnected,
    /// A matching echo arrived after a soft disconnect
    Reconnected,
}

fn fresh_challenge() -> Vec<u8> {
    let mut buf = vec![0u8; CHALLENGE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Spawn the prober task for one channel. The task ends when the outbound
/// channel or the response channel closes; dropping the handle's task clears
/// all timers.
pub fn spawn_prober<F>(
    out: mpsc::UnboundedSender<Frame>,
    mut responses: mpsc::UnboundedReceiver<Vec<u8>>,
    on_event: F,
) -> JoinHandle<()>
where
    F: Fn(LivenessEvent) + Send + 'static,
{
    tokio::spawn(async move {
        let mut alive = true;
        let mut last_sent: Option<Vec<u8>> = None;

        'cycle: loop {
            let challenge = fresh_challenge();

            // retransmit delay; a late echo of the previous challenge still
            // counts and restarts the cycle
            let retransmit = tokio::time::sleep(HEARTBEAT_INTERVAL);
            tokio::pin!(retransmit);
            loop {
                tokio::select! {
                    _ = &mut retransmit => break,
                    resp = responses.recv() => match resp {
                        Some(payload) if last_sent.as_deref() == Some(payload.as_slice()) => {
                            if !alive {
                                alive = true;
                                on_event(LivenessEvent::Reconnected);
                            }
                            continue 'cycle;
                        }
                        Some(_) => trace!("ignoring mismatched heartbeat payload"),
                        None => return,
                    },
                }
            }

            if out.send(Frame::HeartbeatRequest(challenge.clone())).is_err() {
                return;
            }
            last_sent = Some(challenge.clone());

            // disconnect deadline
            let deadline = tokio::time::sleep(HEARTBEAT_TIMEOUT);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        if alive {
                            alive = false;
                            on_event(LivenessEvent::Disconnected);
                        }
                        // next challenge is scheduled immediately
                        continue 'cycle;
                    }
                    resp = responses.recv() => match resp {
                        Some(payload) if payload == challenge => {
                            if !alive {
                                alive = true;
                                on_event(LivenessEvent::Reconnected);
                            }
                            continue 'cycle;
                        }
                        Some(_) => trace!("ignoring mismatched heartbeat payload"),
                        None => return,
                    },
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::{advance, Duration};

    struct Harness {
        out_rx: mpsc::UnboundedReceiver<Frame>,
        resp_tx: mpsc::UnboundedSender<Vec<u8>>,
        events: Arc<Mutex<Vec<LivenessEvent>>>,
        handle: JoinHandle<()>,
    }

    fn start() -> Harness {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handle = spawn_prober(out_tx, resp_rx, move |e| sink.lock().unwrap().push(e));
        Harness {
            out_rx,
            resp_tx,
            events,
            handle,
        }
    }

    async fn next_challenge(h: &mut Harness) -> Vec<u8> {
        loop {
            advance(Duration::from_millis(250)).await;
            if let Ok(frame) = h.out_rx.try_recv() {
                match frame {
                    Frame::HeartbeatRequest(p) => return p,
                    other => panic!("unexpected frame {other:?}"),
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_soft_disconnects() {
        let mut h = start();

        let _challenge = next_challenge(&mut h).await;
        // let the disconnect deadline pass with no echo
        advance(HEARTBEAT_TIMEOUT + Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        assert_eq!(
            h.events.lock().unwrap().as_slice(),
            &[LivenessEvent::Disconnected]
        );
        h.handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_echo_keeps_alive() {
        let mut h = start();

        for _ in 0..3 {
            let challenge = next_challenge(&mut h).await;
            h.resp_tx.send(challenge).unwrap();
            tokio::task::yield_now().await;
        }
        assert!(h.events.lock().unwrap().is_empty());
        h.handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_echo_is_ignored() {
        let mut h = start();

        let _challenge = next_challenge(&mut h).await;
        h.resp_tx.send(vec![0u8; 16]).unwrap();
        advance(HEARTBEAT_TIMEOUT + Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        assert_eq!(
            h.events.lock().unwrap().as_slice(),
            &[LivenessEvent::Disconnected]
        );
        h.handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_after_timeout_reconnects() {
        let mut h = start();

        let _missed = next_challenge(&mut h).await;
        advance(HEARTBEAT_TIMEOUT + Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        // peer comes back and answers the next challenge
        let challenge = next_challenge(&mut h).await;
        h.resp_tx.send(challenge).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(
            h.events.lock().unwrap().as_slice(),
            &[LivenessEvent::Disconnected, LivenessEvent::Reconnected]
        );
        h.handle.abort();
    }
}
