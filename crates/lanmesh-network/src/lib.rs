//! Lanmesh Network Layer
//!
//! Pinned-certificate TLS channels over TCP with the legacy base64 wire
//! wrapping, an in-band heartbeat liveness protocol, and ephemeral-range
//! port probing. A channel comes in two roles: a dialer that verifies the
//! peer certificate against `<sessionName>:<port>`, and a listener that
//! serves its own self-signed certificate and never verifies clients
//! (clients are authenticated later by SRP and IP pinning).

pub mod channel;
pub mod error;
pub mod framing;
pub mod heartbeat;
pub mod port;
pub mod verifier;

pub use channel::{ChannelEvent, DialerConfig, ListenerEvent, TaggedEventTx, TlsDialer, TlsListener};
pub use error::{NetError, NetResult};
pub use framing::{Base64Framed, Frame};
pub use heartbeat::{LivenessEvent, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT};
pub use port::{open_port, EPHEMERAL_PORT_MAX, EPHEMERAL_PORT_MIN};
