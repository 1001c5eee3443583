//! The mesh networking component
//!
//! [`MeshNetwork`] owns the transport, the slot registry and the NAT
//! traversal state. It is driven entirely from the caller's loop:
//!
//! ```text
//! start_as_coordinator / join_mesh*  ─┐
//! poll / poll_at  ─── transport events ──► dispatch ──► registry, events
//!                 └── NAT timers ──► rendezvous datagrams, fallbacks
//! send_* / broadcast_*  ─► transport
//! drain_events  ─► application
//! ```
//!
//! Bootstrap: the coordinator takes slot 0. A joiner connects to it and sends
//! `ClientJoin`; the coordinator answers by broadcasting the peer list. Every
//! peer then dials each lower, non-coordinator slot it is not yet connected
//! to and exchanges `PeerHello`/`PeerAck`. When all known peers are connected
//! the peer broadcasts `MeshReady` once.
//!
//! Failover: when the coordinator's connection drops, every peer elects the
//! lowest connected slot. The winner announces itself and takes over slot
//! bookkeeping; nobody re-sends the peer list to trigger the election.

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::events::MeshEvent;
use crate::nat::{FallbackEndpoint, IntroductionMatch, NatAction, NatTraversal};
use crate::peer::{PeerRecord, PeerRegistry, PeerStatus};
use crate::transport::{
    ConnectionId, DeliveryMode, DisconnectReason, Transport, TransportEvent,
};
use log::{debug, error, info, warn};
use shared::{make_token, MeshMessage, PeerId, RendezvousRequest, RendezvousResponse};
use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

/// Coarse game phase tracked from mixed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPhase {
    #[default]
    Lobby,
    Countdown,
    InMatch,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SessionState {
    pub(crate) local_identity: PeerId,
    pub(crate) local_display_name: String,
    pub(crate) is_coordinator: bool,
    pub(crate) coordinator_slot: usize,
    pub(crate) listen_port: u16,
    /// Empty when NAT traversal is not used
    pub(crate) match_id: String,
    pub(crate) local_token: String,
    pub(crate) match_phase: MatchPhase,
    pub(crate) desync_frame: Option<u32>,
    pub(crate) mesh_ready_sent: bool,
}

pub struct MeshNetwork<T: Transport> {
    pub(crate) transport: T,
    pub(crate) config: MeshConfig,
    pub(crate) registry: PeerRegistry,
    pub(crate) session: SessionState,
    pub(crate) nat: NatTraversal,
    /// Joiner side: the connection to the coordinator until it lands in a slot
    pub(crate) coordinator_connection: Option<ConnectionId>,
    /// Connections we already sent a join or hello on
    greeted: HashSet<ConnectionId>,
    running: bool,
    pub(crate) events: VecDeque<MeshEvent>,
}

impl<T: Transport> MeshNetwork<T> {
    pub fn new(transport: T, config: MeshConfig) -> Self {
        let nat = NatTraversal::new(&config);
        Self {
            transport,
            config,
            registry: PeerRegistry::new(),
            session: SessionState::default(),
            nat,
            coordinator_connection: None,
            greeted: HashSet::new(),
            running: false,
            events: VecDeque::new(),
        }
    }

    /// Starts hosting a mesh from slot 0 and returns the bound port
    pub fn start_as_coordinator(
        &mut self,
        identity: PeerId,
        display_name: &str,
        port: u16,
    ) -> Result<u16, MeshError> {
        self.start_coordinator(identity, display_name, port, None)
    }

    /// Starts hosting and registers `"{match_id}:{identity}"` with the
    /// rendezvous server so joiners can be introduced through NAT
    pub fn start_as_coordinator_with_nat(
        &mut self,
        identity: PeerId,
        display_name: &str,
        port: u16,
        match_id: &str,
    ) -> Result<u16, MeshError> {
        self.start_coordinator(identity, display_name, port, Some(match_id))
    }

    fn start_coordinator(
        &mut self,
        identity: PeerId,
        display_name: &str,
        port: u16,
        match_id: Option<&str>,
    ) -> Result<u16, MeshError> {
        self.begin_session(identity, display_name, port, match_id)?;
        self.session.is_coordinator = true;
        self.session.coordinator_slot = 0;
        self.set_local_slot(0);

        if self.traversal_enabled() {
            self.nat.begin_registration();
        } else if match_id.is_some() {
            warn!("No rendezvous server configured, skipping NAT registration");
        }

        info!(
            "Hosting mesh as {} on port {}",
            display_name, self.session.listen_port
        );
        self.service_nat(Instant::now());
        Ok(self.session.listen_port)
    }

    /// Joins the mesh hosted at `address:port`
    pub fn join_mesh(
        &mut self,
        identity: PeerId,
        display_name: &str,
        address: IpAddr,
        port: u16,
    ) -> Result<u16, MeshError> {
        self.begin_session(identity, display_name, 0, None)?;
        self.connect_to_coordinator(SocketAddr::new(address, port));
        Ok(self.session.listen_port)
    }

    /// Joins through the rendezvous server, falling back to a direct
    /// connect to `address:port` when no introduction arrives in time
    pub fn join_mesh_with_nat(
        &mut self,
        identity: PeerId,
        display_name: &str,
        address: Option<IpAddr>,
        port: u16,
        match_id: &str,
        host_identity: PeerId,
    ) -> Result<u16, MeshError> {
        self.begin_session(identity, display_name, 0, Some(match_id))?;
        let fallback = FallbackEndpoint { address, port };

        if self.config.rendezvous.is_none() {
            self.push_event(MeshEvent::NatPunchResult {
                success: false,
                message: "no rendezvous server configured".to_string(),
            });
            self.connect_to_fallback(fallback);
            return Ok(self.session.listen_port);
        }

        let target = make_token(match_id, host_identity);
        info!("Requesting introduction to coordinator {}", target);
        let now = Instant::now();
        self.nat.begin_coordinator_punch(target, fallback, now);
        self.service_nat(now);
        Ok(self.session.listen_port)
    }

    fn begin_session(
        &mut self,
        identity: PeerId,
        display_name: &str,
        port: u16,
        match_id: Option<&str>,
    ) -> Result<(), MeshError> {
        if self.running {
            return Err(MeshError::AlreadyRunning);
        }
        if identity.is_empty() {
            return Err(MeshError::InvalidIdentity);
        }

        let listen_port = self.transport.start(port)?;
        let match_id = match_id.unwrap_or_default().to_string();
        let local_token = if match_id.is_empty() {
            String::new()
        } else {
            make_token(&match_id, identity)
        };

        self.session = SessionState {
            local_identity: identity,
            local_display_name: display_name.to_string(),
            listen_port,
            match_id,
            local_token,
            ..SessionState::default()
        };
        self.running = true;
        info!("Mesh networking started on port {}", listen_port);
        Ok(())
    }

    /// Closes every connection and forgets the session
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }

        for conn in self.registry.clear() {
            self.transport.disconnect(conn);
        }
        if let Some(conn) = self.coordinator_connection.take() {
            self.transport.disconnect(conn);
        }
        self.transport.stop();
        self.nat.clear();
        self.greeted.clear();
        self.session = SessionState::default();
        self.events.clear();
        self.running = false;
        info!("Mesh networking stopped");
    }

    pub fn poll(&mut self) {
        self.poll_at(Instant::now());
    }

    /// Processes every pending transport event, then services NAT timers
    /// as of `now`
    pub fn poll_at(&mut self, now: Instant) {
        if !self.running {
            return;
        }

        for event in self.transport.poll_events() {
            self.handle_transport_event(event, now);
        }
        self.service_nat(now);
    }

    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        self.events.drain(..).collect()
    }

    fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::ConnectionRequest { addr } => self.handle_connection_request(addr),
            TransportEvent::Connected { conn, addr } => self.handle_connected(conn, addr),
            TransportEvent::Disconnected { conn, reason } => self.handle_disconnected(conn, reason),
            TransportEvent::Received { conn, data, .. } => self.dispatch(conn, &data, now),
            TransportEvent::UnconnectedReceived { addr, data } => {
                self.handle_unconnected(addr, &data)
            }
            TransportEvent::NatIntroductionSuccess { addr, token } => {
                self.handle_introduction(addr, &token)
            }
            TransportEvent::NetworkError { addr, error } => match addr {
                Some(addr) => warn!("Network error with {}: {}", addr, error),
                None => warn!("Network error: {}", error),
            },
        }
    }

    fn handle_connection_request(&mut self, addr: SocketAddr) {
        if self.session.is_coordinator
            && self.registry.free_slot_count(self.session.coordinator_slot) == 0
        {
            warn!("Mesh is full, rejecting connection from {}", addr);
            self.transport.reject(addr);
            return;
        }

        debug!("Accepting connection from {}", addr);
        self.transport.accept(addr);
    }

    fn handle_connected(&mut self, conn: ConnectionId, addr: SocketAddr) {
        if self.greeted.contains(&conn) {
            return;
        }

        if self.coordinator_connection == Some(conn) && self.registry.local_slot().is_none() {
            info!("Connected to coordinator at {}", addr);
            self.send_client_join(conn);
            return;
        }

        match self.registry.slot_for_connection(conn) {
            Some(slot) => {
                let connecting = self
                    .registry
                    .get(slot)
                    .map(|record| record.status == PeerStatus::Connecting)
                    .unwrap_or(false);
                if connecting {
                    self.send_peer_hello(slot, conn);
                }
            }
            None => debug!("Connection {} from {} awaits identification", conn, addr),
        }
    }

    fn handle_disconnected(&mut self, conn: ConnectionId, reason: DisconnectReason) {
        self.greeted.remove(&conn);
        if self.coordinator_connection == Some(conn) {
            self.coordinator_connection = None;
            if self.registry.local_slot().is_none() {
                warn!("Lost coordinator before joining: {}", reason);
                self.push_event(MeshEvent::JoinRejected {
                    reason: reason.to_string(),
                });
                return;
            }
        }

        match self.registry.slot_for_connection(conn) {
            Some(slot) => self.handle_peer_lost(slot, reason),
            None => debug!("Unidentified connection {} closed: {}", conn, reason),
        }
    }

    fn handle_peer_lost(&mut self, slot: usize, reason: DisconnectReason) {
        let was_coordinator = slot == self.session.coordinator_slot;
        if let Some(record) = self.registry.get_mut(slot) {
            info!(
                "Peer {} in slot {} disconnected: {}",
                record.display_name, slot, reason
            );
            record.status = PeerStatus::Disconnected;
            record.connection = None;
        }
        self.nat.cancel_peer_punch(slot);
        self.push_event(MeshEvent::PeerDisconnected { slot });

        if was_coordinator {
            self.elect_coordinator();
        } else if self.session.is_coordinator {
            self.registry.clear_slot(slot);
            self.broadcast_peer_list();
        }
        self.check_mesh_ready();
    }

    /// Picks the lowest connected slot as coordinator
    fn elect_coordinator(&mut self) {
        let Some(winner) = self.registry.find_lowest_connected_slot() else {
            return;
        };

        if Some(winner) == self.registry.local_slot() {
            self.become_coordinator();
        } else if winner != self.session.coordinator_slot {
            info!("Coordinator moved to slot {}", winner);
            self.session.coordinator_slot = winner;
            self.session.is_coordinator = false;
            self.push_event(MeshEvent::CoordinatorChanged { slot: winner });
        }
    }

    fn become_coordinator(&mut self) {
        let Some(local) = self.registry.local_slot() else {
            return;
        };

        info!("Taking over as coordinator from slot {}", local);
        self.session.is_coordinator = true;
        self.session.coordinator_slot = local;
        self.push_event(MeshEvent::CoordinatorChanged { slot: local });
        self.broadcast_infra(&MeshMessage::CoordinatorAnnounce { slot: local as u8 });

        // Losses handled before the takeover left their slots behind
        for slot in self.registry.clear_disconnected() {
            info!("Releasing slot {} left by a departed peer", slot);
            self.nat.cancel_peer_punch(slot);
        }
        self.broadcast_peer_list();
    }

    pub(crate) fn apply_coordinator_announce(&mut self, slot: usize) {
        let is_local = self.registry.local_slot() == Some(slot);
        if self.session.coordinator_slot != slot || self.session.is_coordinator != is_local {
            info!("Coordinator announced at slot {}", slot);
            self.session.coordinator_slot = slot;
            self.session.is_coordinator = is_local;
        }
        self.push_event(MeshEvent::CoordinatorAnnounceReceived { slot });
    }

    fn handle_unconnected(&mut self, addr: SocketAddr, data: &[u8]) {
        if self.config.rendezvous != Some(addr) {
            debug!("Ignoring unconnected datagram from {}", addr);
            return;
        }

        match RendezvousResponse::decode(data) {
            Ok(RendezvousResponse::RegisterAck { success: true }) => {
                if self.nat.confirm_registration() {
                    info!("Rendezvous registration confirmed");
                }
            }
            Ok(RendezvousResponse::RegisterAck { success: false }) => {
                warn!("Rendezvous server refused registration")
            }
            Ok(RendezvousResponse::Introduction { token, endpoint }) => {
                self.handle_introduction(endpoint, &token)
            }
            Err(e) => debug!("Malformed rendezvous datagram: {}", e),
        }
    }

    fn handle_introduction(&mut self, addr: SocketAddr, token: &str) {
        match self.nat.resolve_introduction(token) {
            IntroductionMatch::Coordinator => {
                info!("Introduced to coordinator at {}", addr);
                self.push_event(MeshEvent::NatPunchResult {
                    success: true,
                    message: format!("introduced to coordinator at {}", addr),
                });
                self.connect_to_coordinator(addr);
            }
            IntroductionMatch::Peer(slot) => {
                info!("Introduced to slot {} at {}", slot, addr);
                self.push_event(MeshEvent::NatPunchResult {
                    success: true,
                    message: format!("introduced to slot {} at {}", slot, addr),
                });
                self.connect_peer(slot, addr);
            }
            IntroductionMatch::Unmatched => {
                // The introducer only pairs tokens of the same match, so a
                // stray introduction is a peer punching toward us.
                info!("Unsolicited introduction from {} ({})", addr, token);
                if let Err(e) = self.transport.connect(addr) {
                    warn!("Failed to connect to introduced peer {}: {}", addr, e);
                }
            }
        }
    }

    fn connect_to_coordinator(&mut self, addr: SocketAddr) {
        match self.transport.connect(addr) {
            Ok(conn) => {
                self.coordinator_connection = Some(conn);
                if self.transport.is_connected(conn) {
                    self.send_client_join(conn);
                }
            }
            Err(e) => {
                error!("Failed to connect to coordinator at {}: {}", addr, e);
                self.push_event(MeshEvent::JoinRejected {
                    reason: e.to_string(),
                });
            }
        }
    }

    fn connect_to_fallback(&mut self, fallback: FallbackEndpoint) {
        match self.resolve_endpoint(fallback.address, fallback.port) {
            Some(addr) => {
                info!("Connecting directly to coordinator at {}", addr);
                self.connect_to_coordinator(addr);
            }
            None => {
                warn!("No coordinator address to fall back to");
                self.push_event(MeshEvent::JoinRejected {
                    reason: "no coordinator address known".to_string(),
                });
            }
        }
    }

    /// Dial target for a known port. Without an address this is loopback,
    /// and only when the configuration allows it.
    fn resolve_endpoint(&self, address: Option<IpAddr>, port: u16) -> Option<SocketAddr> {
        if port == 0 {
            return None;
        }
        address
            .or_else(|| {
                self.config
                    .loopback_fallback
                    .then_some(IpAddr::V4(Ipv4Addr::LOCALHOST))
            })
            .map(|ip| SocketAddr::new(ip, port))
    }

    /// Starts connecting to the peer in `slot`, by introduction when possible
    pub(crate) fn initiate_peer_connection(&mut self, slot: usize, now: Instant) {
        let Some(record) = self.registry.get(slot) else {
            return;
        };
        let token = record.nat_token.clone();

        if self.config.rendezvous.is_some() && !token.is_empty() {
            info!("Requesting introduction to slot {} ({})", slot, token);
            self.nat.begin_peer_punch(slot, token, now);
            if let Some(record) = self.registry.get_mut(slot) {
                record.status = PeerStatus::Connecting;
            }
        } else {
            self.connect_peer_direct(slot);
        }
    }

    fn connect_peer_direct(&mut self, slot: usize) {
        let Some(record) = self.registry.get(slot) else {
            return;
        };
        let (address, port) = (record.endpoint_address, record.endpoint_port);

        match self.resolve_endpoint(address, port) {
            Some(addr) => {
                info!("Connecting directly to slot {} at {}", slot, addr);
                self.connect_peer(slot, addr);
            }
            None => {
                warn!("No address known for slot {}", slot);
                if let Some(record) = self.registry.get_mut(slot) {
                    record.status = PeerStatus::Disconnected;
                }
            }
        }
    }

    fn connect_peer(&mut self, slot: usize, addr: SocketAddr) {
        match self.transport.connect(addr) {
            Ok(conn) => {
                let Some(record) = self.registry.get_mut(slot) else {
                    return;
                };
                record.connection = Some(conn);
                record.status = PeerStatus::Connecting;
                if self.transport.is_connected(conn) {
                    self.send_peer_hello(slot, conn);
                }
            }
            Err(e) => {
                warn!("Failed to connect to slot {} at {}: {}", slot, addr, e);
                if let Some(record) = self.registry.get_mut(slot) {
                    record.status = PeerStatus::Disconnected;
                }
            }
        }
    }

    fn service_nat(&mut self, now: Instant) {
        if self.nat.is_registering() && self.registration_finished() {
            info!("Stopping rendezvous registration");
            self.nat.stop_registration();
        }

        for action in self.nat.tick(now) {
            match action {
                NatAction::SendRegister => {
                    let token = self.session.local_token.clone();
                    self.send_rendezvous(&RendezvousRequest::Register { token });
                }
                NatAction::SendPunchRequest { target_token } => {
                    let local_token = self.session.local_token.clone();
                    self.send_rendezvous(&RendezvousRequest::PunchRequest {
                        local_token,
                        target_token,
                    });
                }
                NatAction::CoordinatorPunchTimedOut { fallback } => {
                    warn!("Introduction to coordinator timed out");
                    self.push_event(MeshEvent::NatPunchResult {
                        success: false,
                        message: "introduction to coordinator timed out".to_string(),
                    });
                    self.connect_to_fallback(fallback);
                }
                NatAction::PeerPunchTimedOut { slot } => {
                    warn!("Introduction to slot {} timed out", slot);
                    self.push_event(MeshEvent::NatPunchResult {
                        success: false,
                        message: format!("introduction to slot {} timed out", slot),
                    });
                    self.connect_peer_direct(slot);
                }
            }
        }
    }

    /// A host stops once somebody is connected, a joiner once its mesh is whole
    fn registration_finished(&self) -> bool {
        if self.session.is_coordinator {
            self.registry.connected_peer_count() > 0
        } else {
            self.registry.local_slot().is_some()
                && self.registry.remote_peer_count() > 0
                && self.registry.is_mesh_complete()
        }
    }

    fn send_rendezvous(&mut self, request: &RendezvousRequest) {
        let Some(server) = self.config.rendezvous else {
            return;
        };
        match request.encode() {
            Ok(data) => {
                if let Err(e) = self.transport.send_unconnected(server, &data) {
                    warn!("Failed to reach rendezvous server {}: {}", server, e);
                }
            }
            Err(e) => error!("Failed to encode rendezvous request: {}", e),
        }
    }

    fn traversal_enabled(&self) -> bool {
        self.config.rendezvous.is_some() && !self.session.match_id.is_empty()
    }

    pub(crate) fn set_local_slot(&mut self, slot: usize) {
        self.registry.set_local(
            slot,
            self.session.local_identity,
            &self.session.local_display_name,
            self.session.listen_port,
            &self.session.local_token,
        );
        info!("Local peer holds slot {}", slot);

        if !self.session.is_coordinator && self.traversal_enabled() {
            self.nat.begin_registration();
        }
    }

    /// Re-arms registration while a joiner still expects inbound peers
    pub(crate) fn refresh_registration(&mut self) {
        if !self.session.is_coordinator
            && self.traversal_enabled()
            && !self.registry.is_mesh_complete()
        {
            self.nat.begin_registration();
        }
    }

    /// Broadcasts `MeshReady` the first time the mesh becomes complete
    pub(crate) fn check_mesh_ready(&mut self) {
        let Some(local) = self.registry.local_slot() else {
            return;
        };

        let complete = self.registry.remote_peer_count() > 0 && self.registry.is_mesh_complete();
        if !complete {
            self.session.mesh_ready_sent = false;
            return;
        }
        if self.session.mesh_ready_sent {
            return;
        }

        self.session.mesh_ready_sent = true;
        if let Some(record) = self.registry.get_mut(local) {
            record.is_mesh_ready = true;
        }
        info!(
            "Mesh complete with {} remote peers",
            self.registry.remote_peer_count()
        );
        self.push_event(MeshEvent::MeshComplete);
        self.broadcast_infra(&MeshMessage::MeshReady { slot: local as u8 });
    }

    pub(crate) fn send_client_join(&mut self, conn: ConnectionId) {
        let message = MeshMessage::ClientJoin {
            identity: self.session.local_identity,
            display_name: self.session.local_display_name.clone(),
            listen_port: self.session.listen_port,
        };
        self.greeted.insert(conn);
        self.send_infra(conn, &message);
    }

    pub(crate) fn send_peer_hello(&mut self, slot: usize, conn: ConnectionId) {
        let Some(local) = self.registry.local_slot() else {
            return;
        };
        debug!("Sending hello to slot {}", slot);
        let message = MeshMessage::PeerHello {
            slot: local as u8,
            identity: self.session.local_identity,
            display_name: self.session.local_display_name.clone(),
        };
        self.greeted.insert(conn);
        self.send_infra(conn, &message);
    }

    pub(crate) fn broadcast_peer_list(&mut self) {
        let peers = self.registry.valid().map(PeerRecord::to_entry).collect();
        let message = MeshMessage::PeerList {
            coordinator_slot: self.session.coordinator_slot as u8,
            peers,
        };
        self.broadcast_infra(&message);
    }

    pub(crate) fn send_infra(&mut self, conn: ConnectionId, message: &MeshMessage) {
        match message.encode() {
            Ok(data) => self.transmit(conn, &data, DeliveryMode::ReliableOrdered),
            Err(e) => error!("Failed to encode {:?}: {}", message.message_type(), e),
        }
    }

    pub(crate) fn broadcast_infra(&mut self, message: &MeshMessage) {
        let data = match message.encode() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode {:?}: {}", message.message_type(), e);
                return;
            }
        };
        for (_, conn) in self.registry.live_connections() {
            self.transmit(conn, &data, DeliveryMode::ReliableOrdered);
        }
    }

    pub(crate) fn transmit(&mut self, conn: ConnectionId, data: &[u8], mode: DeliveryMode) {
        if let Err(e) = self.transport.send(conn, data, mode) {
            warn!("Failed to send to {}: {}", conn, e);
        }
    }

    pub(crate) fn push_event(&mut self, event: MeshEvent) {
        self.events.push_back(event);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn local_identity(&self) -> PeerId {
        self.session.local_identity
    }

    pub fn local_slot(&self) -> Option<usize> {
        self.registry.local_slot()
    }

    pub fn is_coordinator(&self) -> bool {
        self.session.is_coordinator
    }

    pub fn coordinator_slot(&self) -> usize {
        self.session.coordinator_slot
    }

    pub fn listen_port(&self) -> u16 {
        self.session.listen_port
    }

    pub fn match_id(&self) -> &str {
        &self.session.match_id
    }

    pub fn match_phase(&self) -> MatchPhase {
        self.session.match_phase
    }

    /// Frame reported by the most recent `DesyncNotify`
    pub fn desync_frame(&self) -> Option<u32> {
        self.session.desync_frame
    }

    pub fn peer(&self, slot: usize) -> Option<&PeerRecord> {
        self.registry.get(slot)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.registry.valid()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn is_mesh_complete(&self) -> bool {
        self.registry.is_mesh_complete()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.registry.connected_peer_count()
    }

    pub fn is_punch_pending(&self, slot: usize) -> bool {
        self.nat.is_punch_pending(slot)
    }

    pub fn is_waiting_for_coordinator_punch(&self) -> bool {
        self.nat.is_waiting_for_coordinator_punch()
    }

    pub fn is_registering(&self) -> bool {
        self.nat.is_registering()
    }

    pub fn is_registration_confirmed(&self) -> bool {
        self.nat.is_registration_confirmed()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimNetwork, SimTransport};
    use std::time::Duration;

    const HOST_PORT: u16 = 7777;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn node(net: &SimNetwork, config: MeshConfig) -> MeshNetwork<SimTransport> {
        MeshNetwork::new(net.transport(localhost()), config)
    }

    fn pump(nodes: &mut [&mut MeshNetwork<SimTransport>]) {
        for _ in 0..20 {
            for node in nodes.iter_mut() {
                node.poll();
            }
        }
    }

    #[test]
    fn test_start_as_coordinator() {
        let net = SimNetwork::new();
        let mut host = node(&net, MeshConfig::default());
        let port = host
            .start_as_coordinator(PeerId::from_u128(1), "host", HOST_PORT)
            .unwrap();

        assert_eq!(port, HOST_PORT);
        assert!(host.is_running());
        assert!(host.is_coordinator());
        assert_eq!(host.local_slot(), Some(0));
        assert_eq!(host.peer(0).unwrap().display_name, "host");
        assert!(!host.is_registering());
    }

    #[test]
    fn test_start_twice_fails() {
        let net = SimNetwork::new();
        let mut host = node(&net, MeshConfig::default());
        host.start_as_coordinator(PeerId::from_u128(1), "host", HOST_PORT)
            .unwrap();
        assert!(matches!(
            host.start_as_coordinator(PeerId::from_u128(1), "host", HOST_PORT),
            Err(MeshError::AlreadyRunning)
        ));
    }

    #[test]
    fn test_empty_identity_rejected() {
        let net = SimNetwork::new();
        let mut host = node(&net, MeshConfig::default());
        assert!(matches!(
            host.start_as_coordinator(PeerId::EMPTY, "host", HOST_PORT),
            Err(MeshError::InvalidIdentity)
        ));
        assert!(!host.is_running());
    }

    #[test]
    fn test_join_assigns_slot_and_completes() {
        let net = SimNetwork::new();
        let mut host = node(&net, MeshConfig::default());
        let mut guest = node(&net, MeshConfig::default());
        host.start_as_coordinator(PeerId::from_u128(1), "host", HOST_PORT)
            .unwrap();
        guest
            .join_mesh(PeerId::from_u128(2), "guest", localhost(), HOST_PORT)
            .unwrap();

        pump(&mut [&mut host, &mut guest]);

        assert_eq!(guest.local_slot(), Some(1));
        assert_eq!(guest.coordinator_slot(), 0);
        assert!(!guest.is_coordinator());
        assert!(host.is_mesh_complete() && guest.is_mesh_complete());

        let host_events = host.drain_events();
        assert!(host_events.contains(&MeshEvent::PeerJoinReceived {
            slot: 1,
            identity: PeerId::from_u128(2),
            display_name: "guest".to_string(),
        }));
        assert!(host_events.contains(&MeshEvent::MeshComplete));

        let guest_events = guest.drain_events();
        assert!(guest_events.contains(&MeshEvent::PeerConnected { slot: 0 }));
        assert!(guest_events.contains(&MeshEvent::MeshReadyReceived { slot: 0 }));
        assert!(host.peer(1).unwrap().is_mesh_ready);
    }

    #[test]
    fn test_mesh_ready_sent_once() {
        let net = SimNetwork::new();
        let mut host = node(&net, MeshConfig::default());
        let mut guest = node(&net, MeshConfig::default());
        host.start_as_coordinator(PeerId::from_u128(1), "host", HOST_PORT)
            .unwrap();
        guest
            .join_mesh(PeerId::from_u128(2), "guest", localhost(), HOST_PORT)
            .unwrap();
        pump(&mut [&mut host, &mut guest]);

        // Repeated peer lists must not re-trigger readiness
        host.broadcast_peer_list();
        host.broadcast_peer_list();
        pump(&mut [&mut host, &mut guest]);

        let ready_count = host
            .drain_events()
            .iter()
            .filter(|event| **event == MeshEvent::MeshReadyReceived { slot: 1 })
            .count();
        assert_eq!(ready_count, 1);
    }

    #[test]
    fn test_join_unreachable_coordinator() {
        let net = SimNetwork::new();
        let mut guest = node(&net, MeshConfig::default());
        guest
            .join_mesh(PeerId::from_u128(2), "guest", localhost(), HOST_PORT)
            .unwrap();
        guest.poll();

        let events = guest.drain_events();
        assert!(matches!(
            events.as_slice(),
            [MeshEvent::JoinRejected { .. }]
        ));
        assert_eq!(guest.local_slot(), None);
    }

    #[test]
    fn test_nat_join_without_rendezvous_connects_directly() {
        let net = SimNetwork::new();
        let mut host = node(&net, MeshConfig::default());
        let mut guest = node(&net, MeshConfig::default());
        host.start_as_coordinator(PeerId::from_u128(1), "host", HOST_PORT)
            .unwrap();
        guest
            .join_mesh_with_nat(
                PeerId::from_u128(2),
                "guest",
                Some(localhost()),
                HOST_PORT,
                "match",
                PeerId::from_u128(1),
            )
            .unwrap();

        assert_eq!(
            guest.drain_events().first(),
            Some(&MeshEvent::NatPunchResult {
                success: false,
                message: "no rendezvous server configured".to_string(),
            })
        );
        pump(&mut [&mut host, &mut guest]);
        assert_eq!(guest.local_slot(), Some(1));
    }

    #[test]
    fn test_punch_timeout_without_address_needs_loopback() {
        let net = SimNetwork::new();
        let rendezvous: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut guest = node(&net, MeshConfig::default().with_rendezvous(rendezvous));
        guest
            .join_mesh_with_nat(
                PeerId::from_u128(2),
                "guest",
                None,
                HOST_PORT,
                "match",
                PeerId::from_u128(1),
            )
            .unwrap();
        assert!(guest.is_waiting_for_coordinator_punch());

        guest.poll_at(Instant::now() + Duration::from_secs(11));
        let events = guest.drain_events();
        assert!(events.contains(&MeshEvent::NatPunchResult {
            success: false,
            message: "introduction to coordinator timed out".to_string(),
        }));
        assert!(events.contains(&MeshEvent::JoinRejected {
            reason: "no coordinator address known".to_string(),
        }));
        assert!(!guest.is_waiting_for_coordinator_punch());
    }

    #[test]
    fn test_coordinator_registration_stops_after_first_peer() {
        let net = SimNetwork::new();
        let rendezvous: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = MeshConfig::default().with_rendezvous(rendezvous);
        let mut host = node(&net, config.clone());
        let mut guest = node(&net, MeshConfig::default());
        host.start_as_coordinator_with_nat(PeerId::from_u128(1), "host", HOST_PORT, "match")
            .unwrap();
        assert!(host.is_registering());

        guest
            .join_mesh(PeerId::from_u128(2), "guest", localhost(), HOST_PORT)
            .unwrap();
        pump(&mut [&mut host, &mut guest]);
        assert!(!host.is_registering());
    }

    #[test]
    fn test_stop_clears_state() {
        let net = SimNetwork::new();
        let mut host = node(&net, MeshConfig::default());
        let mut guest = node(&net, MeshConfig::default());
        host.start_as_coordinator(PeerId::from_u128(1), "host", HOST_PORT)
            .unwrap();
        guest
            .join_mesh(PeerId::from_u128(2), "guest", localhost(), HOST_PORT)
            .unwrap();
        pump(&mut [&mut host, &mut guest]);

        guest.stop();
        assert!(!guest.is_running());
        assert_eq!(guest.local_slot(), None);
        assert_eq!(guest.peers().count(), 0);

        pump(&mut [&mut host]);
        assert!(host.peer(1).is_none());
        assert!(host
            .drain_events()
            .contains(&MeshEvent::PeerDisconnected { slot: 1 }));

        // Stopped nodes can start again
        guest
            .join_mesh(PeerId::from_u128(2), "guest", localhost(), HOST_PORT)
            .unwrap();
        pump(&mut [&mut host, &mut guest]);
        assert_eq!(guest.local_slot(), Some(1));
    }

    #[test]
    fn test_repeated_announce_is_idempotent() {
        let net = SimNetwork::new();
        let mut host = node(&net, MeshConfig::default());
        let mut guest = node(&net, MeshConfig::default());
        host.start_as_coordinator(PeerId::from_u128(1), "host", HOST_PORT)
            .unwrap();
        guest
            .join_mesh(PeerId::from_u128(2), "guest", localhost(), HOST_PORT)
            .unwrap();
        pump(&mut [&mut host, &mut guest]);
        guest.drain_events();

        guest.apply_coordinator_announce(0);
        guest.apply_coordinator_announce(0);
        assert_eq!(guest.coordinator_slot(), 0);
        assert!(!guest.is_coordinator());

        guest.apply_coordinator_announce(1);
        guest.apply_coordinator_announce(1);
        assert_eq!(guest.coordinator_slot(), 1);
        assert!(guest.is_coordinator());

        let events = guest.drain_events();
        assert!(!events
            .iter()
            .any(|event| matches!(event, MeshEvent::CoordinatorChanged { .. })));
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, MeshEvent::CoordinatorAnnounceReceived { .. }))
                .count(),
            4
        );
    }

    #[test]
    fn test_peer_punch_timeout_connects_directly_once() {
        let net = SimNetwork::new();
        let rendezvous: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let nat_config = MeshConfig::default().with_rendezvous(rendezvous);

        // Nothing answers at the rendezvous address, so every punch times out
        let mut host = node(&net, nat_config.clone());
        let mut first = node(&net, MeshConfig::default());
        let mut second = node(&net, nat_config);
        host.start_as_coordinator_with_nat(PeerId::from_u128(1), "host", HOST_PORT, "match")
            .unwrap();
        first
            .join_mesh(PeerId::from_u128(2), "first", localhost(), HOST_PORT)
            .unwrap();
        pump(&mut [&mut host, &mut first]);
        second
            .join_mesh(PeerId::from_u128(3), "second", localhost(), HOST_PORT)
            .unwrap();
        pump(&mut [&mut host, &mut first, &mut second]);

        assert_eq!(second.local_slot(), Some(2));
        assert!(second.is_punch_pending(1));
        assert_eq!(second.peer(1).unwrap().status, PeerStatus::Connecting);
        assert!(!second.is_mesh_complete());

        second.poll_at(Instant::now() + Duration::from_secs(11));
        assert!(!second.is_punch_pending(1));
        pump(&mut [&mut host, &mut first, &mut second]);

        assert!(second.is_mesh_complete());
        assert_eq!(second.connected_peer_count(), 2);
        assert_eq!(first.connected_peer_count(), 2);

        let events = second.drain_events();
        let timeouts = events
            .iter()
            .filter(|event| {
                **event
                    == MeshEvent::NatPunchResult {
                        success: false,
                        message: "introduction to slot 1 timed out".to_string(),
                    }
            })
            .count();
        assert_eq!(timeouts, 1);
        let connects = events
            .iter()
            .filter(|event| **event == MeshEvent::PeerConnected { slot: 1 })
            .count();
        assert_eq!(connects, 1);
    }

    #[test]
    fn test_takeover_releases_earlier_departures() {
        let net = SimNetwork::new();
        let mut nodes: Vec<MeshNetwork<SimTransport>> = Vec::new();
        let mut host = node(&net, MeshConfig::default());
        host.start_as_coordinator(PeerId::from_u128(1), "host", HOST_PORT)
            .unwrap();
        nodes.push(host);
        for n in 2..=4 {
            let mut guest = node(&net, MeshConfig::default());
            guest
                .join_mesh(PeerId::from_u128(n), "guest", localhost(), HOST_PORT)
                .unwrap();
            nodes.push(guest);
            for _ in 0..20 {
                for node in nodes.iter_mut() {
                    node.poll();
                }
            }
        }

        // Slot 1 goes first, while slot 0 still coordinates
        nodes[1].stop();
        nodes[2].poll();
        assert_eq!(nodes[2].coordinator_slot(), 0);
        assert_eq!(nodes[2].peer(1).unwrap().status, PeerStatus::Disconnected);

        nodes[0].stop();
        let mut survivors: Vec<_> = nodes.drain(2..).collect();
        for _ in 0..20 {
            for node in survivors.iter_mut() {
                node.poll();
            }
        }

        for node in &survivors {
            assert_eq!(node.coordinator_slot(), 2);
            assert!(node.peer(0).is_none());
            assert!(node.peer(1).is_none());
            assert!(node.is_mesh_complete());
            assert_eq!(node.connected_peer_count(), 1);
        }
        assert!(survivors[0].is_coordinator());
        assert_eq!(survivors[0].registry().free_slot_count(2), 6);
    }
}
