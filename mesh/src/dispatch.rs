//! Inbound routing and the outbound send primitives
//!
//! Every packet starts with a one-byte tag. Infrastructure tags are consumed
//! here, mixed tags update peer state and are then forwarded, everything
//! else is forwarded untouched as [`MeshEvent::MessageReceived`].

use crate::events::MeshEvent;
use crate::network::{MatchPhase, MeshNetwork};
use crate::peer::{PeerRecord, PeerStatus, SyncMark};
use crate::transport::{ConnectionId, DeliveryMode, Transport};
use log::{debug, info, warn};
use shared::{
    classify, frame, MeshMessage, MessageClass, MessageType, MixedMessage, PeerEntry, PeerId,
    MAX_PEERS,
};
use std::time::Instant;

impl<T: Transport> MeshNetwork<T> {
    pub(crate) fn dispatch(&mut self, conn: ConnectionId, data: &[u8], now: Instant) {
        let Some(&tag) = data.first() else {
            debug!("Dropping empty packet from {}", conn);
            return;
        };

        match classify(tag) {
            MessageClass::Infrastructure => match MeshMessage::decode(data) {
                Ok(message) => self.handle_mesh_message(conn, message, now),
                Err(e) => debug!("Dropping packet from {}: {}", conn, e),
            },
            MessageClass::Mixed => {
                let Some(slot) = self.sender_slot(conn) else {
                    debug!("Dropping tag {} from unidentified {}", tag, conn);
                    return;
                };
                match MixedMessage::parse(tag, &data[1..]) {
                    Ok(message) => {
                        self.apply_mixed(slot, message);
                        self.forward(slot, tag, &data[1..]);
                    }
                    Err(e) => debug!("Dropping packet from slot {}: {}", slot, e),
                }
            }
            MessageClass::Passthrough => {
                let Some(slot) = self.sender_slot(conn) else {
                    debug!("Dropping tag {} from unidentified {}", tag, conn);
                    return;
                };
                self.forward(slot, tag, &data[1..]);
            }
        }
    }

    fn sender_slot(&self, conn: ConnectionId) -> Option<usize> {
        self.registry.slot_for_connection(conn).or_else(|| {
            (self.coordinator_connection == Some(conn)).then_some(self.session.coordinator_slot)
        })
    }

    fn forward(&mut self, slot: usize, tag: u8, payload: &[u8]) {
        self.push_event(MeshEvent::MessageReceived {
            slot,
            tag,
            payload: payload.to_vec(),
        });
    }

    fn handle_mesh_message(&mut self, conn: ConnectionId, message: MeshMessage, now: Instant) {
        match message {
            MeshMessage::ClientJoin {
                identity,
                display_name,
                listen_port,
            } => self.handle_client_join(conn, identity, display_name, listen_port),
            MeshMessage::PeerList {
                coordinator_slot,
                peers,
            } => self.apply_peer_list(conn, coordinator_slot as usize, peers, now),
            MeshMessage::PeerHello {
                slot,
                identity,
                display_name,
            } => self.handle_peer_hello(conn, slot as usize, identity, display_name),
            MeshMessage::PeerAck {
                slot,
                identity,
                display_name,
            } => self.handle_peer_ack(conn, slot as usize, identity, display_name),
            MeshMessage::MeshReady { slot } => {
                let slot = slot as usize;
                if let Some(record) = self.registry.get_mut(slot) {
                    record.is_mesh_ready = true;
                }
                debug!("Slot {} reports a complete mesh", slot);
                self.push_event(MeshEvent::MeshReadyReceived { slot });
            }
            MeshMessage::CoordinatorAnnounce { slot } => {
                self.apply_coordinator_announce(slot as usize)
            }
        }
    }

    fn handle_client_join(
        &mut self,
        conn: ConnectionId,
        identity: PeerId,
        display_name: String,
        listen_port: u16,
    ) {
        if !self.session.is_coordinator {
            warn!("Ignoring join from {}: not the coordinator", display_name);
            return;
        }
        if identity.is_empty() || identity == self.session.local_identity {
            warn!("Refusing join from {} with identity {}", display_name, identity);
            self.transport.disconnect(conn);
            return;
        }

        if let Some(existing) = self.registry.slot_for_identity(identity) {
            let stale = self
                .registry
                .get(existing)
                .and_then(|record| record.connection)
                .filter(|&old| old != conn);
            if let Some(old) = stale {
                info!("{} rejoined, dropping connection {}", display_name, old);
                self.transport.disconnect(old);
            }
        }

        let address = self.transport.remote_addr(conn).map(|addr| addr.ip());
        let assigned = self.registry.assign_slot_for_new_peer(
            identity,
            &display_name,
            conn,
            address,
            listen_port,
            self.session.coordinator_slot,
            &self.session.match_id,
        );

        match assigned {
            Some(slot) => {
                self.push_event(MeshEvent::PeerJoinReceived {
                    slot,
                    identity,
                    display_name,
                });
                self.push_event(MeshEvent::PeerConnected { slot });
                self.broadcast_peer_list();
                self.check_mesh_ready();
            }
            None => {
                warn!("Mesh is full, rejecting {} ({})", display_name, identity);
                self.transport.disconnect(conn);
            }
        }
    }

    /// Merges the coordinator's view of the mesh into ours
    fn apply_peer_list(
        &mut self,
        conn: ConnectionId,
        coordinator_slot: usize,
        peers: Vec<PeerEntry>,
        now: Instant,
    ) {
        if self.session.is_coordinator {
            warn!("Coordinator ignoring peer list from {}", conn);
            return;
        }

        let mut listed = [false; MAX_PEERS];
        for entry in &peers {
            let slot = entry.slot as usize;
            listed[slot] = true;
            if entry.identity == self.session.local_identity {
                if self.registry.local_slot() != Some(slot) {
                    self.set_local_slot(slot);
                }
            } else {
                self.merge_peer_entry(entry);
            }
        }

        self.session.coordinator_slot = coordinator_slot;
        self.session.is_coordinator = self.registry.local_slot() == Some(coordinator_slot);

        // The list always arrives over the coordinator's own connection
        let mut attached = false;
        if Some(coordinator_slot) != self.registry.local_slot() {
            if let Some(record) = self.registry.get_mut(coordinator_slot) {
                if record.connection != Some(conn) || record.status != PeerStatus::Connected {
                    record.connection = Some(conn);
                    record.status = PeerStatus::Connected;
                    attached = true;
                }
            }
        }
        if self.coordinator_connection == Some(conn) && self.registry.local_slot().is_some() {
            self.coordinator_connection = None;
        }
        if attached {
            info!("Coordinator confirmed in slot {}", coordinator_slot);
            self.nat.cancel_peer_punch(coordinator_slot);
            self.push_event(MeshEvent::PeerConnected {
                slot: coordinator_slot,
            });
        }

        for slot in 0..MAX_PEERS {
            if listed[slot] || self.registry.local_slot() == Some(slot) {
                continue;
            }
            let Some(status) = self.registry.get(slot).map(|record| record.status) else {
                continue;
            };
            info!("Slot {} is no longer part of the mesh", slot);
            self.nat.cancel_peer_punch(slot);
            if let Some(old) = self.registry.clear_slot(slot) {
                self.transport.disconnect(old);
            }
            if status == PeerStatus::Connected {
                self.push_event(MeshEvent::PeerDisconnected { slot });
            }
        }

        self.push_event(MeshEvent::PeerListReceived {
            peers: self.registry.valid().cloned().collect(),
        });

        if let Some(local) = self.registry.local_slot() {
            let targets: Vec<usize> = self
                .registry
                .valid()
                .filter(|record| {
                    record.slot < local
                        && record.slot != coordinator_slot
                        && record.status == PeerStatus::Unknown
                })
                .map(|record| record.slot)
                .collect();
            for slot in targets {
                self.initiate_peer_connection(slot, now);
            }
            self.refresh_registration();
        }

        self.check_mesh_ready();
    }

    fn merge_peer_entry(&mut self, entry: &PeerEntry) {
        let slot = entry.slot as usize;
        if self.registry.local_slot() == Some(slot) {
            warn!("Peer list places {} in our own slot {}", entry.identity, slot);
            return;
        }

        let same_peer = self
            .registry
            .get(slot)
            .map(|record| record.identity == entry.identity)
            .unwrap_or(false);

        if !same_peer {
            if let Some(old) = self.registry.clear_slot(slot) {
                self.transport.disconnect(old);
            }
            if let Some(moved) = self.registry.slot_for_identity(entry.identity) {
                if let Some(old) = self.registry.clear_slot(moved) {
                    self.transport.disconnect(old);
                }
            }
        }

        let Some(record) = self.registry.slot_mut(slot) else {
            return;
        };
        if !same_peer {
            *record = PeerRecord::empty(slot);
            record.identity = entry.identity;
        }
        record.display_name = entry.display_name.clone();
        if entry.address.is_some() {
            record.endpoint_address = entry.address;
        }
        record.endpoint_port = entry.port;
        record.nat_token = entry.nat_token.clone();
    }

    fn handle_peer_hello(
        &mut self,
        conn: ConnectionId,
        slot: usize,
        identity: PeerId,
        display_name: String,
    ) {
        if slot >= MAX_PEERS
            || Some(slot) == self.registry.local_slot()
            || identity.is_empty()
            || identity == self.session.local_identity
        {
            warn!("Ignoring hello from {} claiming slot {}", display_name, slot);
            return;
        }

        let same_peer = self
            .registry
            .get(slot)
            .map(|record| record.identity == identity)
            .unwrap_or(false);
        if !same_peer {
            if let Some(old) = self.registry.clear_slot(slot) {
                if old != conn {
                    self.transport.disconnect(old);
                }
            }
        }

        let remote = self.transport.remote_addr(conn);
        let Some(record) = self.registry.slot_mut(slot) else {
            return;
        };
        if !same_peer {
            *record = PeerRecord::empty(slot);
            record.identity = identity;
            if let Some(addr) = remote {
                record.endpoint_address = Some(addr.ip());
                record.endpoint_port = addr.port();
            }
        }
        record.display_name = display_name.clone();
        record.connection = Some(conn);
        record.status = PeerStatus::Connected;
        info!("Hello from {} in slot {}", display_name, slot);
        self.nat.cancel_peer_punch(slot);

        if let Some(local) = self.registry.local_slot() {
            let ack = MeshMessage::PeerAck {
                slot: local as u8,
                identity: self.session.local_identity,
                display_name: self.session.local_display_name.clone(),
            };
            self.send_infra(conn, &ack);
        }

        self.push_event(MeshEvent::PeerHelloReceived {
            slot,
            identity,
            display_name,
        });
        self.push_event(MeshEvent::PeerConnected { slot });
        self.check_mesh_ready();
    }

    fn handle_peer_ack(
        &mut self,
        conn: ConnectionId,
        slot: usize,
        identity: PeerId,
        display_name: String,
    ) {
        let Some(record) = self.registry.get_mut(slot) else {
            debug!("Ack for unknown slot {}", slot);
            return;
        };
        if record.identity != identity {
            warn!("Ack for slot {} carries identity {}", slot, identity);
            return;
        }

        record.connection = Some(conn);
        record.status = PeerStatus::Connected;
        record.display_name = display_name.clone();
        info!("Ack from {} in slot {}", display_name, slot);

        self.push_event(MeshEvent::PeerAckReceived {
            slot,
            identity,
            display_name,
        });
        self.push_event(MeshEvent::PeerConnected { slot });
        self.check_mesh_ready();
    }

    /// Applies the state change carried by a mixed message from `slot`
    fn apply_mixed(&mut self, slot: usize, message: MixedMessage) {
        match message {
            MixedMessage::Ready { ready } => {
                if let Some(record) = self.registry.get_mut(slot) {
                    record.is_ready = ready;
                }
            }
            MixedMessage::LoadComplete => {
                if let Some(record) = self.registry.get_mut(slot) {
                    record.is_loaded = true;
                }
            }
            MixedMessage::MatchStart => {
                self.session.match_phase = MatchPhase::InMatch;
                for other in 0..MAX_PEERS {
                    if let Some(record) = self.registry.get_mut(other) {
                        record.is_restart_ready = false;
                    }
                }
            }
            MixedMessage::StartCountdown => self.session.match_phase = MatchPhase::Countdown,
            MixedMessage::SyncCheck { frame, hash } => {
                if let Some(record) = self.registry.get_mut(slot) {
                    record.last_sync = Some(SyncMark { frame, hash });
                }
            }
            MixedMessage::DesyncNotify { frame } => {
                warn!("Slot {} reports desync at frame {}", slot, frame);
                self.session.desync_frame = Some(frame);
            }
            MixedMessage::RestartReady => {
                if let Some(record) = self.registry.get_mut(slot) {
                    record.is_restart_ready = true;
                    record.is_loaded = false;
                }
            }
        }
    }

    fn accepts_outbound(&self, tag: u8) -> bool {
        if classify(tag) == MessageClass::Infrastructure {
            warn!("Tag {} is reserved for the mesh layer", tag);
            return false;
        }
        true
    }

    /// Sends `[tag][payload]` reliably to one peer; a no-op for our own slot
    /// or a slot without a live connection
    pub fn send_reliable(&mut self, slot: usize, tag: u8, payload: &[u8]) {
        if !self.accepts_outbound(tag) {
            return;
        }
        match self.registry.live_connection(slot) {
            Some(conn) => self.transmit(conn, &frame(tag, payload), DeliveryMode::ReliableOrdered),
            None => debug!("No live connection to slot {}", slot),
        }
    }

    pub fn send_reliable_to_coordinator(&mut self, tag: u8, payload: &[u8]) {
        if !self.accepts_outbound(tag) {
            return;
        }
        let conn = self
            .registry
            .live_connection(self.session.coordinator_slot)
            .or(self.coordinator_connection);
        match conn {
            Some(conn) => self.transmit(conn, &frame(tag, payload), DeliveryMode::ReliableOrdered),
            None => debug!("No connection to the coordinator"),
        }
    }

    pub fn broadcast_reliable(&mut self, tag: u8, payload: &[u8]) {
        self.broadcast(tag, payload, DeliveryMode::ReliableOrdered);
    }

    pub fn broadcast_unreliable(&mut self, tag: u8, payload: &[u8]) {
        self.broadcast(tag, payload, DeliveryMode::Unreliable);
    }

    fn broadcast(&mut self, tag: u8, payload: &[u8], mode: DeliveryMode) {
        if !self.accepts_outbound(tag) {
            return;
        }

        if classify(tag) == MessageClass::Mixed {
            if let (Some(local), Ok(message)) =
                (self.registry.local_slot(), MixedMessage::parse(tag, payload))
            {
                self.apply_mixed(local, message);
            }
        }

        let data = frame(tag, payload);
        for (_, conn) in self.registry.live_connections() {
            self.transmit(conn, &data, mode);
        }
    }

    /// Tells every peer whether we are ready
    pub fn set_local_ready(&mut self, ready: bool) {
        let message = MixedMessage::Ready { ready };
        self.broadcast_reliable(MessageType::Ready.tag(), &message.encode_payload());
    }

    /// Tells every peer that we finished loading
    pub fn mark_local_loaded(&mut self) {
        self.broadcast_reliable(MessageType::LoadComplete.tag(), &[]);
    }
}
