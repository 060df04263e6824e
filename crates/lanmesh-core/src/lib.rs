//! Lanmesh Core
//!
//! The three-phase session protocol:
//!
//! 1. **Coordinator phase** — a passcode-authenticated SRP-6a handshake over
//!    a TLS tunnel pinned to the advertised session name. The host collects
//!    authenticated members and derives a per-member symmetric key.
//! 2. **Mesh bootstrap** — the host distributes the membership roster to
//!    every member over `hello`/`ack-hello`; members open pairwise TLS
//!    channels in a full mesh.
//! 3. **Liveness and recovery** — each pairwise channel runs heartbeat
//!    probing with soft/hard disconnect states and automatic re-handshake.
//!
//! [`session::Host`] and [`session::Client`] compose discovery, coordinator,
//! and node into the public façade.

pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod events;
pub mod node;
pub mod session;
pub mod wire;

pub use coordinator::server::AuthenticatedMember;
pub use discovery::{Discovery, DiscoveryEvent, LanRegistry, ResolvedService, ServiceAd};
pub use error::{SessionError, SessionResult};
pub use events::SessionEvent;
pub use session::{Client, Host, SessionConfig};
