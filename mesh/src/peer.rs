//! Fixed-capacity slot table describing every member of the mesh
//!
//! This module owns the per-slot bookkeeping of the mesh:
//! - Identity, display name and last-known endpoint of each peer
//! - The transport connection handle reaching that peer
//! - Connection status and the readiness flags advanced by game messages
//!
//! The table is an arena of [`MAX_PEERS`] records indexed by slot. A record
//! owns its connection handle; clearing a slot hands the handle back so the
//! caller can close it.

use crate::transport::ConnectionId;
use log::info;
use shared::{make_token, PeerEntry, PeerId, MAX_PEERS};
use std::net::IpAddr;

/// Reachability of a remote slot from the local peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Listed by the coordinator but no connection attempted yet
    Unknown,
    /// Punch or connect in flight
    Connecting,
    Connected,
    /// The link dropped or could not be established
    Disconnected,
}

/// Last desync check reported by a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMark {
    pub frame: u32,
    pub hash: u64,
}

/// State of one mesh slot
///
/// A record is valid while its identity is not [`PeerId::EMPTY`]. The local
/// peer occupies exactly one record, which has no connection and is always
/// `Connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub identity: PeerId,
    pub slot: usize,
    pub connection: Option<ConnectionId>,
    pub endpoint_address: Option<IpAddr>,
    pub endpoint_port: u16,
    pub status: PeerStatus,
    pub display_name: String,
    pub is_ready: bool,
    pub is_loaded: bool,
    pub is_mesh_ready: bool,
    pub is_restart_ready: bool,
    pub last_sync: Option<SyncMark>,
    /// `"{match_id}:{identity}"`, empty when traversal is not used
    pub nat_token: String,
}

impl PeerRecord {
    /// Creates the unoccupied record for `slot`
    pub fn empty(slot: usize) -> Self {
        Self {
            identity: PeerId::EMPTY,
            slot,
            connection: None,
            endpoint_address: None,
            endpoint_port: 0,
            status: PeerStatus::Unknown,
            display_name: String::new(),
            is_ready: false,
            is_loaded: false,
            is_mesh_ready: false,
            is_restart_ready: false,
            last_sync: None,
            nat_token: String::new(),
        }
    }

    /// Checks whether the slot is occupied
    pub fn is_valid(&self) -> bool {
        !self.identity.is_empty()
    }

    /// Builds the peer-list entry describing this record
    pub fn to_entry(&self) -> PeerEntry {
        PeerEntry {
            slot: self.slot as u8,
            identity: self.identity,
            display_name: self.display_name.clone(),
            address: self.endpoint_address,
            port: self.endpoint_port,
            nat_token: self.nat_token.clone(),
        }
    }
}

/// The mesh slot table
///
/// Only the networking component mutates it. Every query is computed from
/// the records on demand, nothing is cached.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    slots: [PeerRecord; MAX_PEERS],
    local_slot: Option<usize>,
}

impl PeerRegistry {
    /// Creates a table with every slot empty and no local slot
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(PeerRecord::empty),
            local_slot: None,
        }
    }

    pub fn local_slot(&self) -> Option<usize> {
        self.local_slot
    }

    /// Returns the record at `slot` when it holds a peer
    pub fn get(&self, slot: usize) -> Option<&PeerRecord> {
        self.slots.get(slot).filter(|record| record.is_valid())
    }

    /// Mutable access to an occupied slot
    ///
    /// Empty slots return `None` so a handler cannot accidentally update a
    /// record nobody holds. Use the crate-internal raw accessor when filling
    /// a slot from a peer list.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut PeerRecord> {
        self.slots.get_mut(slot).filter(|record| record.is_valid())
    }

    /// Raw access regardless of occupancy, for populating a slot
    pub(crate) fn slot_mut(&mut self, slot: usize) -> Option<&mut PeerRecord> {
        self.slots.get_mut(slot)
    }

    /// Iterates over every occupied slot in slot order
    pub fn valid(&self) -> impl Iterator<Item = &PeerRecord> {
        self.slots.iter().filter(|record| record.is_valid())
    }

    /// Claims a slot for a joining peer (coordinator only)
    ///
    /// Scans for the first free slot other than the coordinator's own and
    /// fills it in as `Connected` with cleared readiness flags. A peer that
    /// already holds a slot keeps it and takes the new connection. Returns
    /// `None` when every non-coordinator slot is taken.
    #[allow(clippy::too_many_arguments)]
    pub fn assign_slot_for_new_peer(
        &mut self,
        identity: PeerId,
        display_name: &str,
        connection: ConnectionId,
        address: Option<IpAddr>,
        listen_port: u16,
        coordinator_slot: usize,
        match_id: &str,
    ) -> Option<usize> {
        if identity.is_empty() {
            return None;
        }

        let slot = match self.slot_for_identity(identity) {
            Some(existing) => existing,
            None => (0..MAX_PEERS)
                .filter(|&slot| slot != coordinator_slot)
                .find(|&slot| !self.slots[slot].is_valid())?,
        };

        let record = &mut self.slots[slot];
        *record = PeerRecord::empty(slot);
        record.identity = identity;
        record.display_name = display_name.to_string();
        record.connection = Some(connection);
        record.endpoint_address = address;
        record.endpoint_port = listen_port;
        record.status = PeerStatus::Connected;
        if !match_id.is_empty() {
            record.nat_token = make_token(match_id, identity);
        }

        info!("Assigned slot {} to {} ({})", slot, display_name, identity);
        Some(slot)
    }

    /// Places the local peer at `slot`
    ///
    /// Any other record carrying the local identity is released so the
    /// identity appears at most once.
    pub fn set_local(
        &mut self,
        slot: usize,
        identity: PeerId,
        display_name: &str,
        listen_port: u16,
        nat_token: &str,
    ) {
        if slot >= MAX_PEERS {
            return;
        }

        for other in 0..MAX_PEERS {
            if other != slot && self.slots[other].identity == identity {
                self.slots[other] = PeerRecord::empty(other);
            }
        }

        let previous = std::mem::replace(&mut self.slots[slot], PeerRecord::empty(slot));
        let record = &mut self.slots[slot];
        record.identity = identity;
        record.display_name = display_name.to_string();
        record.endpoint_port = listen_port;
        record.status = PeerStatus::Connected;
        record.nat_token = nat_token.to_string();
        if previous.identity == identity {
            record.is_ready = previous.is_ready;
            record.is_loaded = previous.is_loaded;
            record.is_mesh_ready = previous.is_mesh_ready;
            record.is_restart_ready = previous.is_restart_ready;
            record.last_sync = previous.last_sync;
        }

        self.local_slot = Some(slot);
    }

    /// Releases a slot, returning the connection it held
    pub fn clear_slot(&mut self, slot: usize) -> Option<ConnectionId> {
        let record = self.slots.get_mut(slot)?;
        let connection = record.connection.take();
        *record = PeerRecord::empty(slot);
        if self.local_slot == Some(slot) {
            self.local_slot = None;
        }
        connection
    }

    /// Releases every remote record marked `Disconnected`
    ///
    /// A new coordinator calls this when it takes over. Peers that dropped
    /// while someone else was coordinating are still in the table as
    /// `Disconnected`, and leaving them there would keep the mesh incomplete
    /// and their slots unavailable. Records that are still `Unknown` or
    /// `Connecting` are kept since their links may yet come up. Returns the
    /// released slots in slot order.
    pub fn clear_disconnected(&mut self) -> Vec<usize> {
        let departed: Vec<usize> = self
            .valid()
            .filter(|record| {
                Some(record.slot) != self.local_slot && record.status == PeerStatus::Disconnected
            })
            .map(|record| record.slot)
            .collect();
        for &slot in &departed {
            self.clear_slot(slot);
        }
        departed
    }

    /// True for the local slot, or a `Connected` record holding a connection
    pub fn is_connected(&self, slot: usize) -> bool {
        match self.get(slot) {
            Some(_) if self.local_slot == Some(slot) => true,
            Some(record) => record.status == PeerStatus::Connected && record.connection.is_some(),
            None => false,
        }
    }

    /// Lowest slot that is connected or local; the coordinator election winner
    pub fn find_lowest_connected_slot(&self) -> Option<usize> {
        (0..MAX_PEERS).find(|&slot| self.is_connected(slot))
    }

    /// True when every occupied slot other than our own is `Connected`
    pub fn is_mesh_complete(&self) -> bool {
        self.valid()
            .filter(|record| Some(record.slot) != self.local_slot)
            .all(|record| record.status == PeerStatus::Connected)
    }

    /// Finds the slot whose record holds `connection`
    ///
    /// Transport events only carry connection handles, so this is how a
    /// disconnect or inbound packet is attributed to a peer. Returns `None`
    /// for connections that have not identified themselves yet, such as a
    /// joiner before its join request or a peer before its hello.
    pub fn slot_for_connection(&self, connection: ConnectionId) -> Option<usize> {
        self.valid()
            .find(|record| record.connection == Some(connection))
            .map(|record| record.slot)
    }

    /// Finds the slot held by `identity`
    ///
    /// The empty identity never matches. Used to keep a rejoining peer in
    /// its old slot and to detect a peer list that moved someone.
    pub fn slot_for_identity(&self, identity: PeerId) -> Option<usize> {
        if identity.is_empty() {
            return None;
        }
        self.valid()
            .find(|record| record.identity == identity)
            .map(|record| record.slot)
    }

    /// Connection of a remote peer that is currently reachable
    pub fn live_connection(&self, slot: usize) -> Option<ConnectionId> {
        if self.local_slot == Some(slot) || !self.is_connected(slot) {
            return None;
        }
        self.get(slot).and_then(|record| record.connection)
    }

    /// Every reachable remote peer, in slot order
    pub fn live_connections(&self) -> Vec<(usize, ConnectionId)> {
        (0..MAX_PEERS)
            .filter_map(|slot| self.live_connection(slot).map(|conn| (slot, conn)))
            .collect()
    }

    /// Number of slots a coordinator could still hand out
    pub fn free_slot_count(&self, coordinator_slot: usize) -> usize {
        (0..MAX_PEERS)
            .filter(|&slot| slot != coordinator_slot && !self.slots[slot].is_valid())
            .count()
    }

    /// Number of reachable remote peers
    pub fn connected_peer_count(&self) -> usize {
        self.live_connections().len()
    }

    /// Number of occupied slots other than our own
    pub fn remote_peer_count(&self) -> usize {
        self.valid()
            .filter(|record| Some(record.slot) != self.local_slot)
            .count()
    }

    /// Empties every slot, returning the connections that were held
    pub fn clear(&mut self) -> Vec<ConnectionId> {
        let connections = (0..MAX_PEERS)
            .filter_map(|slot| self.slots[slot].connection)
            .collect();
        self.slots = std::array::from_fn(PeerRecord::empty);
        self.local_slot = None;
        connections
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
