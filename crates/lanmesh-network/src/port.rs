//! Open-TCP-Port Probing
//!
//! Finds a free port by attempting to bind: upward from the start value to
//! the top of the ephemeral range, then downward from `start - 1` to the
//! bottom. The listener used for probing is dropped immediately, freeing the
//! port for the caller.

use rand::Rng;
use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{NetError, NetResult};

/// Bottom of the IANA ephemeral port range
pub const EPHEMERAL_PORT_MIN: u16 = 49152;

/// Top of the IANA ephemeral port range
pub const EPHEMERAL_PORT_MAX: u16 = 65535;

fn random_ephemeral_port() -> u16 {
    rand::rngs::OsRng.gen_range(EPHEMERAL_PORT_MIN..=EPHEMERAL_PORT_MAX)
}

async fn probe(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).await.is_ok()
}

/// Find a free TCP port, starting at `start` (random ephemeral pick when
/// `None`). Probes upward to the ceiling, then downward to the floor.
pub async fn open_port(start: Option<u16>) -> NetResult<u16> {
    let start = start.unwrap_or_else(random_ephemeral_port);

    for port in start..=EPHEMERAL_PORT_MAX {
        if probe(port).await {
            debug!("secured port {port}");
            return Ok(port);
        }
    }
    for port in (EPHEMERAL_PORT_MIN..start).rev() {
        if probe(port).await {
            debug!("secured port {port}");
            return Ok(port);
        }
    }
    Err(NetError::PortExhaustion)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_port_binds() {
        let port = open_port(None).await.unwrap();
        assert!(port >= EPHEMERAL_PORT_MIN);
        // the returned port must actually be bindable
        let listener = TcpListener::bind(("0.0.0.0", port)).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_open_port_skips_occupied() {
        let port = open_port(None).await.unwrap();
        let _holder = TcpListener::bind(("0.0.0.0", port)).await.unwrap();
        let next = open_port(Some(port)).await.unwrap();
        assert_ne!(next, port);
    }
}
