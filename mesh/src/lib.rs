//! # Mesh Networking Core
//!
//! Peer-to-peer session layer for up to eight participants. Every peer holds
//! a direct connection to every other peer; one of them, the coordinator,
//! hands out slots and distributes the peer list.
//!
//! ## Core Responsibilities
//!
//! ### Slot Registry
//! A fixed table of eight slots tracks each peer's identity, endpoint,
//! connection and readiness flags. Slot indices are stable for the whole
//! session and double as the peer's address in the send API.
//!
//! ### Bootstrap and Failover
//! Joiners contact the coordinator, receive the peer list and then dial
//! the other peers themselves. When the coordinator disappears, every peer
//! elects the lowest connected slot without any extra round trip.
//!
//! ### NAT Traversal
//! With a rendezvous server configured, peers register a match token and
//! request introductions instead of dialing blindly. An introduction that
//! never arrives falls back to a direct connect.
//!
//! ### Message Dispatch
//! Inbound packets are classified by their leading tag. Infrastructure
//! messages are consumed by the mesh, mixed messages update peer state on
//! the way to the game, and everything else is passed straight through.
//!
//! ## Module Organization
//!
//! - `network`: [`MeshNetwork`], lifecycle, bootstrap, election, NAT actions
//! - `dispatch`: inbound routing and the send primitives
//! - `peer`: the slot registry
//! - `nat`: registration and punch timers
//! - `transport`: the [`Transport`] seam, with `sim` and `udp` implementations
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use mesh::{MeshConfig, MeshEvent, MeshNetwork, UdpTransport};
//! use shared::PeerId;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut mesh = MeshNetwork::new(UdpTransport::default(), MeshConfig::default());
//!     mesh.start_as_coordinator(PeerId::random(), "host", 7777)?;
//!
//!     loop {
//!         mesh.poll();
//!         for event in mesh.drain_events() {
//!             if let MeshEvent::MessageReceived { slot, tag, payload } = event {
//!                 println!("slot {} sent tag {} ({} bytes)", slot, tag, payload.len());
//!             }
//!         }
//!         std::thread::sleep(Duration::from_millis(16));
//!     }
//! }
//! ```

pub mod config;
mod dispatch;
pub mod error;
pub mod events;
pub mod nat;
pub mod network;
pub mod peer;
pub mod sim;
pub mod transport;
pub mod udp;

pub use config::MeshConfig;
pub use error::MeshError;
pub use events::MeshEvent;
pub use network::{MatchPhase, MeshNetwork};
pub use peer::{PeerRecord, PeerRegistry, PeerStatus, SyncMark};
pub use sim::{SimNetwork, SimTransport};
pub use transport::{
    ConnectionId, DeliveryMode, DisconnectReason, Transport, TransportError, TransportEvent,
};
pub use udp::UdpTransport;
