//! # Rendezvous Server
//!
//! Introduces mesh peers that cannot reach each other directly. Peers
//! register a match token from behind their NAT; the server remembers the
//! public endpoint each token was seen from and, on a punch request, tells
//! both sides where to find the other so they can open a path
//! simultaneously.
//!
//! ## Module Organization
//!
//! - `registry`: token table with TTL and capacity limits
//! - `introducer`: datagram handling, independent of any socket
//! - `server`: tokio UDP loop driving the introducer

pub mod introducer;
pub mod registry;
pub mod server;

pub use introducer::{Introducer, Reply};
pub use registry::{Registration, RegistrationTable, RendezvousConfig};
pub use server::{RendezvousServer, ServerMessage};
