//! UDP implementation of [`Transport`]
//!
//! One non-blocking socket carries every connection. Datagrams whose first
//! byte is at least [`FRAME_BASE`] are transport frames:
//!
//! ```text
//! 0xC1 connect request     0xC6 reliable [seq u32 LE][payload]
//! 0xC2 accept              0xC7 ack      [seq u32 LE]
//! 0xC3 reject              0xC8 keepalive
//! 0xC4 disconnect          0xC9 punch probe
//! 0xC5 unreliable [payload]
//! ```
//!
//! Anything below `FRAME_BASE` is an unconnected datagram, which is how the
//! rendezvous protocol reaches us. An introduction makes the transport fire
//! punch probes at the introduced endpoint so the NAT mapping opens before
//! the mesh connects.
//!
//! Reliable frames are resent until acknowledged and delivered in sequence
//! order; early arrivals wait in a reorder buffer.

use crate::transport::{
    parse_introduction, ConnectionId, DeliveryMode, DisconnectReason, Transport, TransportError,
    TransportEvent,
};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

pub const FRAME_BASE: u8 = 0xC0;
const CONNECT_REQUEST: u8 = 0xC1;
const ACCEPT: u8 = 0xC2;
const REJECT: u8 = 0xC3;
const DISCONNECT: u8 = 0xC4;
const UNRELIABLE: u8 = 0xC5;
const RELIABLE: u8 = 0xC6;
const ACK: u8 = 0xC7;
const KEEPALIVE: u8 = 0xC8;
const PUNCH_PROBE: u8 = 0xC9;

const CONNECT_RETRY: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESEND_INTERVAL: Duration = Duration::from_millis(200);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const PUNCH_PROBES: usize = 3;
/// Largest UDP payload over IPv4
const MAX_DATAGRAM: usize = 65_507;
/// Largest payload `send` accepts, leaving room for the reliable header
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - 5;
/// Reliable frames further than this ahead of the next expected sequence
/// are dropped unacknowledged and arrive again through resends
const REORDER_WINDOW: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Connecting { started: Instant, last_attempt: Instant },
    Open,
}

#[derive(Debug)]
struct UdpConnection {
    addr: SocketAddr,
    state: ConnectionState,
    last_received: Instant,
    last_sent: Instant,
    next_send_seq: u32,
    /// Reliable frames awaiting an ack, with the time they were last sent
    unacked: BTreeMap<u32, (Vec<u8>, Instant)>,
    next_recv_seq: u32,
    reorder: BTreeMap<u32, Vec<u8>>,
}

impl UdpConnection {
    fn new(addr: SocketAddr, state: ConnectionState, now: Instant) -> Self {
        Self {
            addr,
            state,
            last_received: now,
            last_sent: now,
            next_send_seq: 0,
            unacked: BTreeMap::new(),
            next_recv_seq: 0,
            reorder: BTreeMap::new(),
        }
    }

    fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

pub struct UdpTransport {
    bind_ip: IpAddr,
    socket: Option<UdpSocket>,
    connections: HashMap<ConnectionId, UdpConnection>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    /// Remotes that asked to connect and await accept or reject
    pending_requests: HashSet<SocketAddr>,
    next_conn: u32,
    events: VecDeque<TransportEvent>,
}

impl UdpTransport {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            socket: None,
            connections: HashMap::new(),
            by_addr: HashMap::new(),
            pending_requests: HashSet::new(),
            next_conn: 0,
            events: VecDeque::new(),
        }
    }

    fn send_raw(&mut self, addr: SocketAddr, data: &[u8]) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        if let Err(e) = socket.send_to(data, addr) {
            if e.kind() != ErrorKind::WouldBlock {
                self.events.push_back(TransportEvent::NetworkError {
                    addr: Some(addr),
                    error: e.to_string(),
                });
            }
        }
    }

    fn send_frame(&mut self, conn: ConnectionId, data: &[u8], now: Instant) {
        let Some(addr) = self.connections.get_mut(&conn).map(|connection| {
            connection.last_sent = now;
            connection.addr
        }) else {
            return;
        };
        self.send_raw(addr, data);
    }

    fn insert_connection(
        &mut self,
        addr: SocketAddr,
        state: ConnectionState,
        now: Instant,
    ) -> ConnectionId {
        self.next_conn += 1;
        let conn = ConnectionId(self.next_conn);
        self.connections
            .insert(conn, UdpConnection::new(addr, state, now));
        self.by_addr.insert(addr, conn);
        conn
    }

    fn remove_connection(&mut self, conn: ConnectionId) -> Option<UdpConnection> {
        let connection = self.connections.remove(&conn)?;
        self.by_addr.remove(&connection.addr);
        Some(connection)
    }

    fn close(&mut self, conn: ConnectionId, reason: DisconnectReason) {
        if let Some(connection) = self.remove_connection(conn) {
            debug!("Connection {} to {} closed: {}", conn, connection.addr, reason);
            self.events
                .push_back(TransportEvent::Disconnected { conn, reason });
        }
    }

    /// Opens the connection to `addr` (creating it if needed) and answers
    /// with an accept frame
    fn open(&mut self, addr: SocketAddr, now: Instant) -> ConnectionId {
        self.pending_requests.remove(&addr);
        let (conn, newly_open) = match self.by_addr.get(&addr).copied() {
            Some(conn) => {
                let newly_open = match self.connections.get_mut(&conn) {
                    Some(connection) if !connection.is_open() => {
                        connection.state = ConnectionState::Open;
                        connection.last_received = now;
                        true
                    }
                    _ => false,
                };
                (conn, newly_open)
            }
            None => (self.insert_connection(addr, ConnectionState::Open, now), true),
        };

        self.send_frame(conn, &[ACCEPT], now);
        if newly_open {
            self.events
                .push_back(TransportEvent::Connected { conn, addr });
        }
        conn
    }

    fn receive(&mut self, now: Instant) {
        let mut datagrams = Vec::new();
        if let Some(socket) = self.socket.as_ref() {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((len, from)) => datagrams.push((from, buf[..len].to_vec())),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    // ICMP port unreachable surfaces as a reset on some platforms
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                    Err(e) => {
                        self.events.push_back(TransportEvent::NetworkError {
                            addr: None,
                            error: e.to_string(),
                        });
                        break;
                    }
                }
            }
        }

        for (from, data) in datagrams {
            self.handle_datagram(from, &data, now);
        }
    }

    fn handle_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        let Some(&kind) = data.first() else {
            return;
        };

        if kind < FRAME_BASE {
            self.handle_unconnected(from, data, now);
            return;
        }

        let conn = self.by_addr.get(&from).copied();
        match kind {
            CONNECT_REQUEST => match conn {
                Some(_) => {
                    self.open(from, now);
                }
                None => {
                    if self.pending_requests.insert(from) {
                        self.events
                            .push_back(TransportEvent::ConnectionRequest { addr: from });
                    }
                }
            },
            ACCEPT => {
                if let Some(conn) = conn {
                    self.promote(conn, now);
                }
            }
            REJECT => {
                let connecting = conn
                    .and_then(|conn| self.connections.get(&conn))
                    .map(|connection| !connection.is_open())
                    .unwrap_or(false);
                if let (Some(conn), true) = (conn, connecting) {
                    self.close(conn, DisconnectReason::Rejected);
                }
            }
            DISCONNECT => {
                self.pending_requests.remove(&from);
                if let Some(conn) = conn {
                    self.close(conn, DisconnectReason::RemoteClosed);
                }
            }
            UNRELIABLE | RELIABLE | ACK | KEEPALIVE => {
                let Some(conn) = conn else {
                    debug!("Dropping frame {:#x} from unknown {}", kind, from);
                    return;
                };
                // Data before the accept means the accept was lost
                self.promote(conn, now);
                if let Some(connection) = self.connections.get_mut(&conn) {
                    connection.last_received = now;
                }
                self.handle_connected_frame(conn, kind, &data[1..], now);
            }
            PUNCH_PROBE => debug!("Punch probe from {}", from),
            _ => debug!("Unknown frame {:#x} from {}", kind, from),
        }
    }

    fn promote(&mut self, conn: ConnectionId, now: Instant) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        if connection.is_open() {
            return;
        }
        connection.state = ConnectionState::Open;
        connection.last_received = now;
        let addr = connection.addr;
        self.events
            .push_back(TransportEvent::Connected { conn, addr });
    }

    fn handle_connected_frame(&mut self, conn: ConnectionId, kind: u8, body: &[u8], now: Instant) {
        match kind {
            UNRELIABLE => self.events.push_back(TransportEvent::Received {
                conn,
                data: body.to_vec(),
                mode: DeliveryMode::Unreliable,
            }),
            RELIABLE => {
                let Some(seq) = read_seq(body) else {
                    return;
                };
                if !self.accept_reliable(conn, seq, body[4..].to_vec()) {
                    debug!("Dropping reliable frame {} outside the window on {}", seq, conn);
                    return;
                }
                let mut ack = vec![ACK];
                ack.extend_from_slice(&seq.to_le_bytes());
                self.send_frame(conn, &ack, now);
            }
            ACK => {
                if let (Some(seq), Some(connection)) =
                    (read_seq(body), self.connections.get_mut(&conn))
                {
                    connection.unacked.remove(&seq);
                }
            }
            _ => {}
        }
    }

    /// Queues a reliable payload, returning false when it lies beyond the
    /// reorder window and must not be acknowledged
    fn accept_reliable(&mut self, conn: ConnectionId, seq: u32, payload: Vec<u8>) -> bool {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return false;
        };
        if seq < connection.next_recv_seq {
            return true;
        }
        if seq - connection.next_recv_seq >= REORDER_WINDOW {
            return false;
        }
        connection.reorder.insert(seq, payload);

        let mut ready = Vec::new();
        while let Some(payload) = connection.reorder.remove(&connection.next_recv_seq) {
            ready.push(payload);
            connection.next_recv_seq += 1;
        }
        for data in ready {
            self.events.push_back(TransportEvent::Received {
                conn,
                data,
                mode: DeliveryMode::ReliableOrdered,
            });
        }
        true
    }

    fn handle_unconnected(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        match parse_introduction(data) {
            Some((endpoint, token)) => {
                info!("Introduced to {} ({}), punching", endpoint, token);
                for _ in 0..PUNCH_PROBES {
                    self.send_raw(endpoint, &[PUNCH_PROBE]);
                }
                // A pending connect would otherwise wait for its next retry
                if let Some(&conn) = self.by_addr.get(&endpoint) {
                    self.send_frame(conn, &[CONNECT_REQUEST], now);
                }
                self.events
                    .push_back(TransportEvent::NatIntroductionSuccess { addr: endpoint, token });
            }
            None => self.events.push_back(TransportEvent::UnconnectedReceived {
                addr: from,
                data: data.to_vec(),
            }),
        }
    }

    fn service(&mut self, now: Instant) {
        let conns: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for conn in conns {
            let Some(connection) = self.connections.get_mut(&conn) else {
                continue;
            };

            match connection.state {
                ConnectionState::Connecting {
                    started,
                    last_attempt,
                } => {
                    if now.saturating_duration_since(started) >= CONNECT_TIMEOUT {
                        warn!("Connect to {} timed out", connection.addr);
                        self.close(conn, DisconnectReason::ConnectFailed);
                    } else if now.saturating_duration_since(last_attempt) >= CONNECT_RETRY {
                        connection.state = ConnectionState::Connecting {
                            started,
                            last_attempt: now,
                        };
                        self.send_frame(conn, &[CONNECT_REQUEST], now);
                    }
                }
                ConnectionState::Open => {
                    if now.saturating_duration_since(connection.last_received) >= IDLE_TIMEOUT {
                        warn!("Connection {} to {} timed out", conn, connection.addr);
                        self.close(conn, DisconnectReason::Timeout);
                        continue;
                    }

                    let resend: Vec<Vec<u8>> = connection
                        .unacked
                        .values_mut()
                        .filter(|(_, sent)| now.saturating_duration_since(*sent) >= RESEND_INTERVAL)
                        .map(|(frame, sent)| {
                            *sent = now;
                            frame.clone()
                        })
                        .collect();
                    let idle = now.saturating_duration_since(connection.last_sent) >= KEEPALIVE_INTERVAL;

                    for frame in &resend {
                        self.send_frame(conn, frame, now);
                    }
                    if resend.is_empty() && idle {
                        self.send_frame(conn, &[KEEPALIVE], now);
                    }
                }
            }
        }
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

fn read_seq(body: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = body.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

impl Transport for UdpTransport {
    fn start(&mut self, port: u16) -> Result<u16, TransportError> {
        if self.socket.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let addr = SocketAddr::new(self.bind_ip, port);
        let socket = UdpSocket::bind(addr).map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => TransportError::AddressInUse(addr),
            _ => TransportError::Io(e),
        })?;
        socket.set_nonblocking(true)?;
        let port = socket.local_addr()?.port();

        info!("UDP transport listening on {}:{}", self.bind_ip, port);
        self.socket = Some(socket);
        Ok(port)
    }

    fn stop(&mut self) {
        let now = Instant::now();
        let conns: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for conn in conns {
            self.send_frame(conn, &[DISCONNECT], now);
        }
        self.connections.clear();
        self.by_addr.clear();
        self.pending_requests.clear();
        self.events.clear();
        self.socket = None;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId, TransportError> {
        if self.socket.is_none() {
            return Err(TransportError::NotStarted);
        }
        if let Some(&conn) = self.by_addr.get(&addr) {
            return Ok(conn);
        }

        let now = Instant::now();
        if self.pending_requests.contains(&addr) {
            return Ok(self.open(addr, now));
        }

        let conn = self.insert_connection(
            addr,
            ConnectionState::Connecting {
                started: now,
                last_attempt: now,
            },
            now,
        );
        debug!("Connecting to {} as {}", addr, conn);
        self.send_frame(conn, &[CONNECT_REQUEST], now);
        Ok(conn)
    }

    fn accept(&mut self, addr: SocketAddr) {
        if self.pending_requests.contains(&addr) {
            self.open(addr, Instant::now());
        }
    }

    fn reject(&mut self, addr: SocketAddr) {
        if self.pending_requests.remove(&addr) {
            self.send_raw(addr, &[REJECT]);
        }
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        self.send_frame(conn, &[DISCONNECT], Instant::now());
        self.remove_connection(conn);
    }

    fn is_connected(&self, conn: ConnectionId) -> bool {
        self.connections
            .get(&conn)
            .map(UdpConnection::is_open)
            .unwrap_or(false)
    }

    fn remote_addr(&self, conn: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&conn).map(|connection| connection.addr)
    }

    fn send(
        &mut self,
        conn: ConnectionId,
        data: &[u8],
        mode: DeliveryMode,
    ) -> Result<(), TransportError> {
        let now = Instant::now();
        if data.len() > MAX_PAYLOAD {
            return Err(TransportError::PayloadTooLarge {
                size: data.len(),
                max: MAX_PAYLOAD,
            });
        }
        let connection = self
            .connections
            .get_mut(&conn)
            .filter(|connection| connection.is_open())
            .ok_or(TransportError::NotConnected(conn))?;

        let frame = match mode {
            DeliveryMode::Unreliable => {
                let mut frame = Vec::with_capacity(data.len() + 1);
                frame.push(UNRELIABLE);
                frame.extend_from_slice(data);
                frame
            }
            DeliveryMode::ReliableOrdered => {
                let seq = connection.next_send_seq;
                connection.next_send_seq += 1;
                let mut frame = Vec::with_capacity(data.len() + 5);
                frame.push(RELIABLE);
                frame.extend_from_slice(&seq.to_le_bytes());
                frame.extend_from_slice(data);
                connection.unacked.insert(seq, (frame.clone(), now));
                frame
            }
        };

        self.send_frame(conn, &frame, now);
        Ok(())
    }

    fn send_unconnected(&mut self, addr: SocketAddr, data: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotStarted)?;
        match socket.send_to(data, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let now = Instant::now();
        self.receive(now);
        self.service(now);
        self.events.drain(..).collect()
    }
}
