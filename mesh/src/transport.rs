//! Boundary between the mesh core and whatever moves its packets
//!
//! The mesh never touches sockets itself. It drives a [`Transport`] that
//! offers connection-oriented reliable and unreliable delivery, unconnected
//! datagrams for the rendezvous server, and a NAT punch module that turns
//! rendezvous introductions into [`TransportEvent::NatIntroductionSuccess`].
//!
//! All methods are non-blocking. Events accumulate inside the transport and
//! are handed over in order by [`Transport::poll_events`].

use shared::rendezvous::INTRODUCTION_TAG;
use shared::RendezvousResponse;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Opaque handle to one transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Retransmitted until acknowledged, delivered in send order
    ReliableOrdered,
    /// Fire and forget
    Unreliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectFailed,
    Rejected,
    RemoteClosed,
    Timeout,
    LocalClosed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::ConnectFailed => "connect failed",
            DisconnectReason::Rejected => "rejected",
            DisconnectReason::RemoteClosed => "closed by remote",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::LocalClosed => "closed locally",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not started")]
    NotStarted,
    #[error("transport is already started")]
    AlreadyStarted,
    #[error("address {0} is already in use")]
    AddressInUse(SocketAddr),
    #[error("connection {0} is not open")]
    NotConnected(ConnectionId),
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote wants to connect; answer with `accept` or `reject`
    ConnectionRequest { addr: SocketAddr },
    Connected { conn: ConnectionId, addr: SocketAddr },
    Disconnected {
        conn: ConnectionId,
        reason: DisconnectReason,
    },
    Received {
        conn: ConnectionId,
        data: Vec<u8>,
        mode: DeliveryMode,
    },
    UnconnectedReceived { addr: SocketAddr, data: Vec<u8> },
    /// The rendezvous server introduced us to `addr`, which registered as `token`
    NatIntroductionSuccess { addr: SocketAddr, token: String },
    NetworkError {
        addr: Option<SocketAddr>,
        error: String,
    },
}

pub trait Transport {
    /// Starts listening; port 0 asks for an ephemeral port. Returns the bound port.
    fn start(&mut self, port: u16) -> Result<u16, TransportError>;

    /// Closes every connection and releases the socket
    fn stop(&mut self);

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Opens a connection, or returns the existing one to `addr`
    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId, TransportError>;

    fn accept(&mut self, addr: SocketAddr);

    fn reject(&mut self, addr: SocketAddr);

    fn disconnect(&mut self, conn: ConnectionId);

    fn is_connected(&self, conn: ConnectionId) -> bool;

    fn remote_addr(&self, conn: ConnectionId) -> Option<SocketAddr>;

    fn send(
        &mut self,
        conn: ConnectionId,
        data: &[u8],
        mode: DeliveryMode,
    ) -> Result<(), TransportError>;

    fn send_unconnected(&mut self, addr: SocketAddr, data: &[u8]) -> Result<(), TransportError>;

    /// Hands over every event queued since the previous call
    fn poll_events(&mut self) -> Vec<TransportEvent>;
}

/// Punch module hook shared by the transports: recognises a rendezvous
/// introduction among unconnected datagrams.
pub fn parse_introduction(data: &[u8]) -> Option<(SocketAddr, String)> {
    if data.first() != Some(&INTRODUCTION_TAG) {
        return None;
    }
    match RendezvousResponse::decode(data) {
        Ok(RendezvousResponse::Introduction { token, endpoint }) => Some((endpoint, token)),
        _ => None,
    }
}
