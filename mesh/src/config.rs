//! Mesh tuning knobs

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration of a [`MeshNetwork`](crate::network::MeshNetwork)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Rendezvous server used for NAT introductions; `None` disables traversal
    pub rendezvous: Option<SocketAddr>,
    /// How long a punch may wait for an introduction before falling back
    pub punch_timeout: Duration,
    /// Gap between repeated punch requests
    pub punch_retry_interval: Duration,
    /// Re-registration period until the server confirms
    pub register_interval: Duration,
    /// Re-registration period once confirmed
    pub confirmed_register_interval: Duration,
    /// Dial 127.0.0.1 when a fallback has a port but no address.
    /// Only useful when every peer runs on one machine.
    pub loopback_fallback: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            rendezvous: None,
            punch_timeout: Duration::from_secs(10),
            punch_retry_interval: Duration::from_secs(1),
            register_interval: Duration::from_secs(1),
            confirmed_register_interval: Duration::from_secs(5),
            loopback_fallback: false,
        }
    }
}

impl MeshConfig {
    pub fn with_rendezvous(mut self, addr: SocketAddr) -> Self {
        self.rendezvous = Some(addr);
        self
    }

    pub fn with_loopback_fallback(mut self, enabled: bool) -> Self {
        self.loopback_fallback = enabled;
        self
    }
}
