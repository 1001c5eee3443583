//! Request handling for the rendezvous protocol
//!
//! The introducer is a pure function of its table: every datagram in
//! produces zero or more datagrams out. The UDP server and in-process test
//! harnesses both drive it the same way.

use crate::registry::{RegistrationTable, RendezvousConfig};
use log::{debug, info, warn};
use shared::{RendezvousRequest, RendezvousResponse};
use std::net::SocketAddr;
use std::time::Instant;

/// Outbound datagram produced while handling a request
pub type Reply = (SocketAddr, Vec<u8>);

pub struct Introducer {
    table: RegistrationTable,
}

impl Introducer {
    pub fn new(config: RendezvousConfig) -> Self {
        Self {
            table: RegistrationTable::new(&config),
        }
    }

    /// Handles one datagram received from `from`
    pub fn handle_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) -> Vec<Reply> {
        match RendezvousRequest::decode(data) {
            Ok(RendezvousRequest::Register { token }) => self.handle_register(from, token, now),
            Ok(RendezvousRequest::PunchRequest {
                local_token,
                target_token,
            }) => self.handle_punch_request(from, local_token, target_token, now),
            Err(e) => {
                debug!("Ignoring malformed datagram from {}: {}", from, e);
                Vec::new()
            }
        }
    }

    fn handle_register(&mut self, from: SocketAddr, token: String, now: Instant) -> Vec<Reply> {
        if token.is_empty() {
            return Vec::new();
        }

        let success = self.table.register(&token, from, now);
        if success {
            debug!("Registered {} at {}", token, from);
        } else {
            warn!("Registration table full, refusing {}", token);
        }

        encode(from, RendezvousResponse::RegisterAck { success })
            .into_iter()
            .collect()
    }

    /// Introduces the requester and the target to each other.
    ///
    /// The requester is refreshed under its own token first so a peer that
    /// only ever punches is still reachable by later requests.
    fn handle_punch_request(
        &mut self,
        from: SocketAddr,
        local_token: String,
        target_token: String,
        now: Instant,
    ) -> Vec<Reply> {
        if !local_token.is_empty() {
            self.table.register(&local_token, from, now);
        }

        let target_addr = match self.table.lookup(&target_token, now) {
            Some(target) => target.addr,
            None => {
                debug!("Punch request from {} for unknown {}", from, target_token);
                return Vec::new();
            }
        };

        if target_addr == from {
            return Vec::new();
        }

        info!(
            "Introducing {} ({}) and {} ({})",
            local_token, from, target_token, target_addr
        );

        let to_requester = RendezvousResponse::Introduction {
            token: target_token,
            endpoint: target_addr,
        };
        let to_target = RendezvousResponse::Introduction {
            token: local_token,
            endpoint: from,
        };

        encode(from, to_requester)
            .into_iter()
            .chain(encode(target_addr, to_target))
            .collect()
    }

    /// Drops stale registrations, returning how many were removed
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired = self.table.check_timeouts(now);
        for token in &expired {
            debug!("Registration {} expired", token);
        }
        expired.len()
    }

    pub fn table(&self) -> &RegistrationTable {
        &self.table
    }
}

impl Default for Introducer {
    fn default() -> Self {
        Self::new(RendezvousConfig::default())
    }
}

fn encode(to: SocketAddr, response: RendezvousResponse) -> Option<Reply> {
    match response.encode() {
        Ok(data) => Some((to, data)),
        Err(e) => {
            warn!("Failed to encode response for {}: {}", to, e);
            None
        }
    }
}
