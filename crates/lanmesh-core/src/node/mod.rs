//! Mesh Node
//!
//! One TLS listener plus N TLS dialers per member. [`MeshNode`] carries the
//! shared machinery (neighbor table, event loop, reconnection controller);
//! [`HostNode`] layers the roster distribution and ack counting on top,
//! [`ClientNode`] the roster intake.

mod client;
mod host;
mod mesh;
mod neighbor;

pub use client::ClientNode;
pub use host::HostNode;
pub use mesh::MeshNode;
