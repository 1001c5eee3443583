//! Wire vocabulary shared by mesh peers and the rendezvous server
//!
//! Everything that crosses a socket is defined here so both ends agree on it:
//! - [`PeerId`], the 128-bit identity every mesh participant carries
//! - [`protocol`], the tag-framed mesh messages and their classification
//! - [`rendezvous`], the unconnected datagrams spoken with the introducer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod protocol;
pub mod rendezvous;

pub use protocol::{
    classify, frame, MeshMessage, MessageClass, MessageType, MixedMessage, PeerEntry,
    ProtocolError,
};
pub use rendezvous::{make_token, RendezvousRequest, RendezvousResponse};

/// Total number of slots in a mesh, coordinator included
pub const MAX_PEERS: usize = 8;

/// Globally unique identity of a mesh participant
///
/// The nil value is reserved as the "empty slot" sentinel and never names a
/// real peer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Sentinel marking an unoccupied slot
    pub const EMPTY: PeerId = PeerId(Uuid::nil());

    /// Generates a fresh random identity
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
