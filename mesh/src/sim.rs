//! In-memory transport for tests and local simulation
//!
//! A [`SimNetwork`] is a shared broker that routes packets between
//! [`SimTransport`] endpoints keyed by socket address. Delivery is
//! instantaneous, lossless and in order; an endpoint only sees traffic when
//! it calls [`Transport::poll_events`], so the caller controls interleaving.
//!
//! A rendezvous server can be attached with [`SimNetwork::set_rendezvous`].
//! Unconnected datagrams sent to its address are handed to the hook and the
//! replies are delivered as if the server had sent them.

use crate::transport::{
    parse_introduction, ConnectionId, DeliveryMode, DisconnectReason, Transport, TransportError,
    TransportEvent,
};
use log::debug;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

/// First port handed out for `start(0)`
pub const EPHEMERAL_PORT_START: u16 = 40000;

/// Answers the datagrams sent to a simulated rendezvous server
pub type RendezvousHook = Box<dyn FnMut(SocketAddr, &[u8]) -> Vec<(SocketAddr, Vec<u8>)>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Pending,
    Open,
}

#[derive(Debug)]
struct Link {
    remote: SocketAddr,
    state: LinkState,
}

#[derive(Debug, Default)]
struct Endpoint {
    events: VecDeque<TransportEvent>,
    links: HashMap<ConnectionId, Link>,
    /// Remotes whose connection request awaits accept or reject
    incoming: HashSet<SocketAddr>,
    next_conn: u32,
}

impl Endpoint {
    fn link_to(&self, remote: SocketAddr) -> Option<ConnectionId> {
        self.links
            .iter()
            .find(|(_, link)| link.remote == remote)
            .map(|(conn, _)| *conn)
    }

    fn link_state(&self, remote: SocketAddr) -> Option<LinkState> {
        self.link_to(remote)
            .and_then(|conn| self.links.get(&conn))
            .map(|link| link.state)
    }

    fn allocate(&mut self) -> ConnectionId {
        self.next_conn += 1;
        ConnectionId(self.next_conn)
    }

    /// Opens (or promotes) the link to `remote` and reports it
    fn open(&mut self, remote: SocketAddr) -> ConnectionId {
        let conn = match self.link_to(remote) {
            Some(conn) => conn,
            None => {
                let conn = self.allocate();
                self.links.insert(
                    conn,
                    Link {
                        remote,
                        state: LinkState::Pending,
                    },
                );
                conn
            }
        };
        if let Some(link) = self.links.get_mut(&conn) {
            link.state = LinkState::Open;
        }
        self.incoming.remove(&remote);
        self.events.push_back(TransportEvent::Connected { conn, addr: remote });
        conn
    }

    fn drop_link(&mut self, remote: SocketAddr) -> Option<ConnectionId> {
        let conn = self.link_to(remote)?;
        self.links.remove(&conn);
        Some(conn)
    }
}

struct Hub {
    endpoints: HashMap<SocketAddr, Endpoint>,
    next_port: u16,
    rendezvous: Option<(SocketAddr, RendezvousHook)>,
}

impl Hub {
    fn bind(&mut self, ip: IpAddr, port: u16) -> Result<SocketAddr, TransportError> {
        let port = if port == 0 {
            let free = (self.next_port..=u16::MAX)
                .find(|&candidate| !self.endpoints.contains_key(&SocketAddr::new(ip, candidate)))
                .ok_or(TransportError::AddressInUse(SocketAddr::new(ip, 0)))?;
            self.next_port = free.saturating_add(1);
            free
        } else {
            port
        };

        let addr = SocketAddr::new(ip, port);
        if self.endpoints.contains_key(&addr) {
            return Err(TransportError::AddressInUse(addr));
        }
        self.endpoints.insert(addr, Endpoint::default());
        Ok(addr)
    }

    fn release(&mut self, at: SocketAddr) {
        let Some(endpoint) = self.endpoints.remove(&at) else {
            return;
        };

        for link in endpoint.links.values() {
            self.notify_closed(link.remote, at, DisconnectReason::RemoteClosed);
        }
        for remote in &endpoint.incoming {
            self.notify_closed(*remote, at, DisconnectReason::ConnectFailed);
        }
    }

    /// Drops `remote`'s link toward `closed` and tells it why
    fn notify_closed(&mut self, remote: SocketAddr, closed: SocketAddr, reason: DisconnectReason) {
        if let Some(endpoint) = self.endpoints.get_mut(&remote) {
            endpoint.incoming.remove(&closed);
            if let Some(conn) = endpoint.drop_link(closed) {
                endpoint
                    .events
                    .push_back(TransportEvent::Disconnected { conn, reason });
            }
        }
    }

    fn connect(&mut self, from: SocketAddr, to: SocketAddr) -> Result<ConnectionId, TransportError> {
        let local = self
            .endpoints
            .get_mut(&from)
            .ok_or(TransportError::NotStarted)?;
        if let Some(conn) = local.link_to(to) {
            return Ok(conn);
        }

        let remote_state = match self.endpoints.get(&to) {
            Some(remote) => remote.link_state(from),
            None => {
                let local = self
                    .endpoints
                    .get_mut(&from)
                    .ok_or(TransportError::NotStarted)?;
                let conn = local.allocate();
                local.events.push_back(TransportEvent::Disconnected {
                    conn,
                    reason: DisconnectReason::ConnectFailed,
                });
                return Ok(conn);
            }
        };

        // Both sides dialing each other collapses into one connection
        if remote_state == Some(LinkState::Pending) {
            let conn = self.open_at(from, to);
            self.open_at(to, from);
            return Ok(conn);
        }

        let local = self
            .endpoints
            .get_mut(&from)
            .ok_or(TransportError::NotStarted)?;
        let conn = local.allocate();
        local.links.insert(
            conn,
            Link {
                remote: to,
                state: LinkState::Pending,
            },
        );
        if let Some(remote) = self.endpoints.get_mut(&to) {
            remote.incoming.insert(from);
            remote
                .events
                .push_back(TransportEvent::ConnectionRequest { addr: from });
        }
        Ok(conn)
    }

    fn open_at(&mut self, at: SocketAddr, remote: SocketAddr) -> ConnectionId {
        self.endpoints
            .get_mut(&at)
            .map(|endpoint| endpoint.open(remote))
            .unwrap_or(ConnectionId(0))
    }

    fn accept(&mut self, at: SocketAddr, remote: SocketAddr) {
        let answered = self
            .endpoints
            .get_mut(&at)
            .map(|endpoint| endpoint.incoming.remove(&remote))
            .unwrap_or(false);
        let requester_waiting = self
            .endpoints
            .get(&remote)
            .and_then(|endpoint| endpoint.link_state(at))
            == Some(LinkState::Pending);

        if answered && requester_waiting {
            self.open_at(at, remote);
            self.open_at(remote, at);
        }
    }

    fn reject(&mut self, at: SocketAddr, remote: SocketAddr) {
        let answered = self
            .endpoints
            .get_mut(&at)
            .map(|endpoint| endpoint.incoming.remove(&remote))
            .unwrap_or(false);
        if answered {
            self.notify_closed(remote, at, DisconnectReason::Rejected);
        }
    }

    fn disconnect(&mut self, at: SocketAddr, conn: ConnectionId) {
        let link = self
            .endpoints
            .get_mut(&at)
            .and_then(|endpoint| endpoint.links.remove(&conn));
        if let Some(link) = link {
            self.notify_closed(link.remote, at, DisconnectReason::RemoteClosed);
        }
    }

    fn link(&self, at: SocketAddr, conn: ConnectionId) -> Option<&Link> {
        self.endpoints
            .get(&at)
            .and_then(|endpoint| endpoint.links.get(&conn))
    }

    fn send(
        &mut self,
        at: SocketAddr,
        conn: ConnectionId,
        data: &[u8],
        mode: DeliveryMode,
    ) -> Result<(), TransportError> {
        let remote = self
            .link(at, conn)
            .filter(|link| link.state == LinkState::Open)
            .map(|link| link.remote)
            .ok_or(TransportError::NotConnected(conn))?;

        if let Some(endpoint) = self.endpoints.get_mut(&remote) {
            if let Some(remote_conn) = endpoint.link_to(at) {
                endpoint.events.push_back(TransportEvent::Received {
                    conn: remote_conn,
                    data: data.to_vec(),
                    mode,
                });
            }
        }
        Ok(())
    }

    fn send_unconnected(&mut self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let replies = match self.rendezvous.as_mut() {
            Some((server, hook)) if *server == to => Some((*server, hook(from, data))),
            _ => None,
        };

        match replies {
            Some((server, replies)) => {
                for (target, payload) in replies {
                    self.deliver_unconnected(server, target, payload);
                }
            }
            None => self.deliver_unconnected(from, to, data.to_vec()),
        }
    }

    fn deliver_unconnected(&mut self, from: SocketAddr, to: SocketAddr, data: Vec<u8>) {
        let Some(endpoint) = self.endpoints.get_mut(&to) else {
            debug!("Dropping datagram from {} to unbound {}", from, to);
            return;
        };

        let event = match parse_introduction(&data) {
            Some((addr, token)) => TransportEvent::NatIntroductionSuccess { addr, token },
            None => TransportEvent::UnconnectedReceived { addr: from, data },
        };
        endpoint.events.push_back(event);
    }
}

/// Shared broker connecting simulated endpoints
#[derive(Clone)]
pub struct SimNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self {
            hub: Rc::new(RefCell::new(Hub {
                endpoints: HashMap::new(),
                next_port: EPHEMERAL_PORT_START,
                rendezvous: None,
            })),
        }
    }

    /// Creates an unstarted endpoint that will bind on `ip`
    pub fn transport(&self, ip: IpAddr) -> SimTransport {
        SimTransport {
            hub: self.hub.clone(),
            ip,
            addr: None,
        }
    }

    pub fn set_rendezvous(&self, addr: SocketAddr, hook: RendezvousHook) {
        self.hub.borrow_mut().rendezvous = Some((addr, hook));
    }

    pub fn is_bound(&self, addr: SocketAddr) -> bool {
        self.hub.borrow().endpoints.contains_key(&addr)
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SimTransport {
    hub: Rc<RefCell<Hub>>,
    ip: IpAddr,
    addr: Option<SocketAddr>,
}

impl Transport for SimTransport {
    fn start(&mut self, port: u16) -> Result<u16, TransportError> {
        if self.addr.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let addr = self.hub.borrow_mut().bind(self.ip, port)?;
        self.addr = Some(addr);
        Ok(addr.port())
    }

    fn stop(&mut self) {
        if let Some(addr) = self.addr.take() {
            self.hub.borrow_mut().release(addr);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId, TransportError> {
        let local = self.addr.ok_or(TransportError::NotStarted)?;
        self.hub.borrow_mut().connect(local, addr)
    }

    fn accept(&mut self, addr: SocketAddr) {
        if let Some(local) = self.addr {
            self.hub.borrow_mut().accept(local, addr);
        }
    }

    fn reject(&mut self, addr: SocketAddr) {
        if let Some(local) = self.addr {
            self.hub.borrow_mut().reject(local, addr);
        }
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        if let Some(local) = self.addr {
            self.hub.borrow_mut().disconnect(local, conn);
        }
    }

    fn is_connected(&self, conn: ConnectionId) -> bool {
        let Some(local) = self.addr else {
            return false;
        };
        self.hub
            .borrow()
            .link(local, conn)
            .map(|link| link.state == LinkState::Open)
            .unwrap_or(false)
    }

    fn remote_addr(&self, conn: ConnectionId) -> Option<SocketAddr> {
        let local = self.addr?;
        self.hub.borrow().link(local, conn).map(|link| link.remote)
    }

    fn send(
        &mut self,
        conn: ConnectionId,
        data: &[u8],
        mode: DeliveryMode,
    ) -> Result<(), TransportError> {
        let local = self.addr.ok_or(TransportError::NotStarted)?;
        self.hub.borrow_mut().send(local, conn, data, mode)
    }

    fn send_unconnected(&mut self, addr: SocketAddr, data: &[u8]) -> Result<(), TransportError> {
        let local = self.addr.ok_or(TransportError::NotStarted)?;
        self.hub.borrow_mut().send_unconnected(local, addr, data);
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        let Some(local) = self.addr else {
            return Vec::new();
        };
        self.hub
            .borrow_mut()
            .endpoints
            .get_mut(&local)
            .map(|endpoint| endpoint.events.drain(..).collect())
            .unwrap_or_default()
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
