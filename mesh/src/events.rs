//! Notifications the mesh hands to the application
//!
//! Events are queued while [`MeshNetwork::poll`](crate::network::MeshNetwork::poll)
//! or a send runs and are collected afterwards with
//! [`MeshNetwork::drain_events`](crate::network::MeshNetwork::drain_events),
//! so application code never runs inside the poll loop.

use crate::peer::PeerRecord;
use shared::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    PeerConnected {
        slot: usize,
    },
    PeerDisconnected {
        slot: usize,
    },
    /// Coordinator side: a joiner was given `slot`
    PeerJoinReceived {
        slot: usize,
        identity: PeerId,
        display_name: String,
    },
    /// Our attempt to join failed before we were given a slot
    JoinRejected {
        reason: String,
    },
    PeerListReceived {
        peers: Vec<PeerRecord>,
    },
    PeerHelloReceived {
        slot: usize,
        identity: PeerId,
        display_name: String,
    },
    PeerAckReceived {
        slot: usize,
        identity: PeerId,
        display_name: String,
    },
    MeshReadyReceived {
        slot: usize,
    },
    /// Every known peer is connected to us
    MeshComplete,
    CoordinatorAnnounceReceived {
        slot: usize,
    },
    /// Our own election view moved the coordinator to `slot`
    CoordinatorChanged {
        slot: usize,
    },
    NatPunchResult {
        success: bool,
        message: String,
    },
    /// A mixed or passthrough message for the game
    MessageReceived {
        slot: usize,
        tag: u8,
        payload: Vec<u8>,
    },
}
