//! Token registrations held by the rendezvous server
//!
//! Peers behind NAT register a `"{match_id}:{identity}"` token from the
//! socket they will use for the mesh. The server records the source address
//! it observed, which is the public side of the peer's NAT mapping, and
//! hands it to the other side of a punch request. Entries that stop being
//! refreshed expire so stale mappings are never introduced.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Limits applied to the registration table
#[derive(Debug, Clone, Copy)]
pub struct RendezvousConfig {
    /// How long a registration survives without being refreshed
    pub ttl: Duration,
    /// Upper bound on live tokens; refreshes are still accepted when full
    pub max_registrations: usize,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_registrations: 1024,
        }
    }
}

/// A peer's public endpoint as observed by the server
#[derive(Debug, Clone)]
pub struct Registration {
    /// Match-scoped token the peer registered under
    pub token: String,
    /// Source address of the most recent registration
    pub addr: SocketAddr,
    /// When the token was first seen
    pub registered_at: Instant,
    /// Last register or punch request carrying this token
    pub last_seen: Instant,
}

impl Registration {
    fn new(token: String, addr: SocketAddr, now: Instant) -> Self {
        Self {
            token,
            addr,
            registered_at: now,
            last_seen: now,
        }
    }

    /// Checks if the registration has not been refreshed within `ttl`
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > ttl
    }
}

/// Maps match tokens to the endpoint they were last seen from
pub struct RegistrationTable {
    entries: HashMap<String, Registration>,
    ttl: Duration,
    max_entries: usize,
}

impl RegistrationTable {
    /// Creates an empty table with the TTL and capacity from `config`
    pub fn new(config: &RendezvousConfig) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: config.ttl,
            max_entries: config.max_registrations,
        }
    }

    /// Inserts or refreshes the registration for `token`.
    ///
    /// A known token always succeeds and moves to `addr`, since a peer's
    /// NAT mapping may change between registrations. A new token is refused
    /// once the table is full.
    pub fn register(&mut self, token: &str, addr: SocketAddr, now: Instant) -> bool {
        if let Some(entry) = self.entries.get_mut(token) {
            entry.addr = addr;
            entry.last_seen = now;
            return true;
        }

        if self.entries.len() >= self.max_entries {
            return false;
        }

        self.entries
            .insert(token.to_string(), Registration::new(token.to_string(), addr, now));
        true
    }

    /// Finds a live registration for `token`
    ///
    /// Expired entries are treated as absent even before the periodic
    /// sweep removes them, so a punch request never introduces an endpoint
    /// whose NAT mapping has likely closed.
    pub fn lookup(&self, token: &str, now: Instant) -> Option<&Registration> {
        self.entries
            .get(token)
            .filter(|entry| !entry.is_expired(now, self.ttl))
    }

    /// Removes a registration outright
    ///
    /// Returns true if the token was present. The server itself only drops
    /// entries through expiry; this is for embedders that learn a peer has
    /// left by other means.
    pub fn remove(&mut self, token: &str) -> bool {
        self.entries.remove(token).is_some()
    }

    /// Drops every expired registration and returns the removed tokens
    ///
    /// Called periodically by the server's expiry task. Lookups already
    /// ignore expired entries; this sweep reclaims their capacity.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<String> {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|entry| entry.is_expired(now, ttl))
            .map(|entry| entry.token.clone())
            .collect();

        for token in &expired {
            self.entries.remove(token);
        }

        expired
    }

    /// Number of stored registrations, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
