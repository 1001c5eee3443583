//! NAT traversal bookkeeping
//!
//! Tracks three kinds of rendezvous activity, all driven by wall-clock checks
//! from [`NatTraversal::tick`]:
//!
//! ```text
//! registration:      Idle → Registering (fast) → Confirmed (slow) → Idle
//! coordinator punch: Idle → Requesting → Success | TimedOut
//! peer punch [slot]: Idle → Requesting → Success | TimedOut
//! ```
//!
//! Nothing here performs I/O. `tick` returns [`NatAction`]s that the mesh
//! turns into datagrams and connection attempts; introductions are matched
//! with [`NatTraversal::resolve_introduction`].

use crate::config::MeshConfig;
use shared::MAX_PEERS;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// One outstanding request for an introduction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunchAttempt {
    pub target_token: String,
    pub started_at: Instant,
    pub last_request: Option<Instant>,
}

impl PunchAttempt {
    fn new(target_token: String, now: Instant) -> Self {
        Self {
            target_token,
            started_at: now,
            last_request: None,
        }
    }

    fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.started_at) >= timeout
    }

    fn is_request_due(&self, now: Instant, interval: Duration) -> bool {
        match self.last_request {
            Some(last) => now.saturating_duration_since(last) >= interval,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Registration {
    last_sent: Option<Instant>,
    confirmed: bool,
}

/// Where a joiner falls back to when the coordinator punch times out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackEndpoint {
    pub address: Option<IpAddr>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatAction {
    SendRegister,
    SendPunchRequest { target_token: String },
    CoordinatorPunchTimedOut { fallback: FallbackEndpoint },
    PeerPunchTimedOut { slot: usize },
}

/// Which pending punch an introduction answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntroductionMatch {
    Coordinator,
    Peer(usize),
    Unmatched,
}

#[derive(Debug)]
pub struct NatTraversal {
    punch_timeout: Duration,
    punch_retry_interval: Duration,
    register_interval: Duration,
    confirmed_register_interval: Duration,

    registration: Option<Registration>,
    coordinator_punch: Option<PunchAttempt>,
    coordinator_fallback: FallbackEndpoint,
    peer_punches: [Option<PunchAttempt>; MAX_PEERS],
}

impl NatTraversal {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            punch_timeout: config.punch_timeout,
            punch_retry_interval: config.punch_retry_interval,
            register_interval: config.register_interval,
            confirmed_register_interval: config.confirmed_register_interval,
            registration: None,
            coordinator_punch: None,
            coordinator_fallback: FallbackEndpoint {
                address: None,
                port: 0,
            },
            peer_punches: Default::default(),
        }
    }

    /// Starts periodic registration; a no-op while already registering
    pub fn begin_registration(&mut self) {
        if self.registration.is_none() {
            self.registration = Some(Registration {
                last_sent: None,
                confirmed: false,
            });
        }
    }

    pub fn stop_registration(&mut self) {
        self.registration = None;
    }

    pub fn is_registering(&self) -> bool {
        self.registration.is_some()
    }

    pub fn is_registration_confirmed(&self) -> bool {
        self.registration
            .as_ref()
            .map(|registration| registration.confirmed)
            .unwrap_or(false)
    }

    /// Records a server confirmation; returns true only for the first one
    pub fn confirm_registration(&mut self) -> bool {
        match self.registration.as_mut() {
            Some(registration) if !registration.confirmed => {
                registration.confirmed = true;
                true
            }
            _ => false,
        }
    }

    pub fn begin_coordinator_punch(
        &mut self,
        target_token: String,
        fallback: FallbackEndpoint,
        now: Instant,
    ) {
        self.coordinator_punch = Some(PunchAttempt::new(target_token, now));
        self.coordinator_fallback = fallback;
    }

    pub fn is_waiting_for_coordinator_punch(&self) -> bool {
        self.coordinator_punch.is_some()
    }

    pub fn coordinator_target(&self) -> Option<&str> {
        self.coordinator_punch
            .as_ref()
            .map(|attempt| attempt.target_token.as_str())
    }

    pub fn begin_peer_punch(&mut self, slot: usize, target_token: String, now: Instant) {
        if let Some(entry) = self.peer_punches.get_mut(slot) {
            *entry = Some(PunchAttempt::new(target_token, now));
        }
    }

    pub fn cancel_peer_punch(&mut self, slot: usize) {
        if let Some(entry) = self.peer_punches.get_mut(slot) {
            *entry = None;
        }
    }

    pub fn is_punch_pending(&self, slot: usize) -> bool {
        self.peer_punches
            .get(slot)
            .map(Option::is_some)
            .unwrap_or(false)
    }

    pub fn peer_punch(&self, slot: usize) -> Option<&PunchAttempt> {
        self.peer_punches.get(slot).and_then(Option::as_ref)
    }

    /// Matches an introduction token against the pending punches
    ///
    /// A matching punch is cleared. The coordinator target wins over a peer
    /// slot carrying the same token.
    pub fn resolve_introduction(&mut self, token: &str) -> IntroductionMatch {
        if self.coordinator_target() == Some(token) {
            self.coordinator_punch = None;
            return IntroductionMatch::Coordinator;
        }

        let slot = self.peer_punches.iter().position(|entry| {
            entry
                .as_ref()
                .map(|attempt| attempt.target_token == token)
                .unwrap_or(false)
        });

        match slot {
            Some(slot) => {
                self.peer_punches[slot] = None;
                IntroductionMatch::Peer(slot)
            }
            None => IntroductionMatch::Unmatched,
        }
    }

    /// Advances every timer and reports what is due
    ///
    /// A timed-out punch is removed in the same call that reports it, so
    /// each attempt times out at most once.
    pub fn tick(&mut self, now: Instant) -> Vec<NatAction> {
        let mut actions = Vec::new();

        if let Some(registration) = self.registration.as_mut() {
            let interval = if registration.confirmed {
                self.confirmed_register_interval
            } else {
                self.register_interval
            };
            let due = match registration.last_sent {
                Some(last) => now.saturating_duration_since(last) >= interval,
                None => true,
            };
            if due {
                registration.last_sent = Some(now);
                actions.push(NatAction::SendRegister);
            }
        }

        if let Some(attempt) = self.coordinator_punch.as_mut() {
            if attempt.is_timed_out(now, self.punch_timeout) {
                self.coordinator_punch = None;
                actions.push(NatAction::CoordinatorPunchTimedOut {
                    fallback: self.coordinator_fallback,
                });
            } else if attempt.is_request_due(now, self.punch_retry_interval) {
                attempt.last_request = Some(now);
                actions.push(NatAction::SendPunchRequest {
                    target_token: attempt.target_token.clone(),
                });
            }
        }

        for slot in 0..MAX_PEERS {
            let Some(attempt) = self.peer_punches[slot].as_mut() else {
                continue;
            };
            if attempt.is_timed_out(now, self.punch_timeout) {
                self.peer_punches[slot] = None;
                actions.push(NatAction::PeerPunchTimedOut { slot });
            } else if attempt.is_request_due(now, self.punch_retry_interval) {
                attempt.last_request = Some(now);
                actions.push(NatAction::SendPunchRequest {
                    target_token: attempt.target_token.clone(),
                });
            }
        }

        actions
    }

    /// Abandons every registration and punch
    pub fn clear(&mut self) {
        self.registration = None;
        self.coordinator_punch = None;
        self.coordinator_fallback = FallbackEndpoint {
            address: None,
            port: 0,
        };
        self.peer_punches = Default::default();
    }
}
