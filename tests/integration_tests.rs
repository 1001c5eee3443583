//! Integration tests for the mesh, the rendezvous server and their wiring
//!
//! Most scenarios run on the in-memory transport with an explicit clock so
//! NAT timers can be driven without sleeping. The last group runs over real
//! loopback sockets.

use mesh::{MeshConfig, MeshEvent, MeshNetwork, SimNetwork, SimTransport};
use rendezvous::Introducer;
use shared::protocol::FIRST_GAME_TAG;
use shared::{PeerId, MAX_PEERS};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

const HOST_PORT: u16 = 7777;

fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

fn rendezvous_addr() -> SocketAddr {
    SocketAddr::new(ip(100), 7000)
}

/// Attaches an in-process introducer to the simulated network
fn attach_introducer(net: &SimNetwork) {
    let mut introducer = Introducer::default();
    net.set_rendezvous(
        rendezvous_addr(),
        Box::new(move |from, data| introducer.handle_datagram(from, data, Instant::now())),
    );
}

/// Test clock advanced in fixed steps while polling every node
struct Clock {
    now: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            now: Instant::now(),
        }
    }

    fn pump(&mut self, nodes: &mut [MeshNetwork<SimTransport>], rounds: usize) {
        for _ in 0..rounds {
            self.now += Duration::from_millis(50);
            for node in nodes.iter_mut() {
                node.poll_at(self.now);
            }
        }
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
    }
}

fn host(net: &SimNetwork, config: MeshConfig) -> MeshNetwork<SimTransport> {
    let mut node = MeshNetwork::new(net.transport(localhost()), config);
    node.start_as_coordinator(PeerId::from_u128(1), "host", HOST_PORT)
        .unwrap();
    node
}

fn guest(net: &SimNetwork, n: u128) -> MeshNetwork<SimTransport> {
    let mut node = MeshNetwork::new(net.transport(localhost()), MeshConfig::default());
    node.join_mesh(
        PeerId::from_u128(n + 1),
        &format!("guest-{}", n),
        localhost(),
        HOST_PORT,
    )
    .unwrap();
    node
}

/// MESH BOOTSTRAP TESTS
mod bootstrap_tests {
    use super::*;

    /// Fills every slot and checks the ninth joiner is turned away
    #[test]
    fn full_mesh_rejects_ninth_peer() {
        let net = SimNetwork::new();
        let mut clock = Clock::new();
        let mut nodes = vec![host(&net, MeshConfig::default())];

        for n in 1..MAX_PEERS as u128 {
            nodes.push(guest(&net, n));
            clock.pump(&mut nodes, 10);
        }

        for (slot, node) in nodes.iter().enumerate() {
            assert_eq!(node.local_slot(), Some(slot));
            assert!(node.is_mesh_complete(), "slot {} incomplete", slot);
            assert_eq!(node.connected_peer_count(), MAX_PEERS - 1);
        }

        let mut late = guest(&net, 99);
        clock.pump(&mut nodes, 2);
        clock.pump(std::slice::from_mut(&mut late), 2);
        clock.pump(&mut nodes, 2);

        let rejected = late
            .drain_events()
            .into_iter()
            .any(|event| matches!(event, MeshEvent::JoinRejected { .. }));
        assert!(rejected);
        assert_eq!(late.local_slot(), None);
        assert_eq!(nodes[0].connected_peer_count(), MAX_PEERS - 1);
    }

    /// The coordinator leaves; slot 1 takes over and admits a newcomer
    #[test]
    fn failover_then_rejoin() {
        let net = SimNetwork::new();
        let mut clock = Clock::new();
        let mut nodes = vec![host(&net, MeshConfig::default())];
        for n in 1..=3 {
            nodes.push(guest(&net, n));
            clock.pump(&mut nodes, 10);
        }

        nodes[0].stop();
        let mut survivors: Vec<_> = nodes.drain(1..).collect();
        clock.pump(&mut survivors, 10);

        assert!(survivors[0].is_coordinator());
        for node in &survivors {
            assert_eq!(node.coordinator_slot(), 1);
            assert!(node.is_mesh_complete());
            assert_eq!(node.connected_peer_count(), 2);
        }

        let new_port = survivors[0].listen_port();
        let mut newcomer = MeshNetwork::new(net.transport(localhost()), MeshConfig::default());
        newcomer
            .join_mesh(PeerId::from_u128(50), "late", localhost(), new_port)
            .unwrap();
        survivors.push(newcomer);
        clock.pump(&mut survivors, 10);

        // The departed coordinator's slot is free again
        assert_eq!(survivors[3].local_slot(), Some(0));
        for node in &survivors {
            assert!(node.is_mesh_complete());
            assert_eq!(node.connected_peer_count(), 3);
        }
    }

    /// Two peers drop at once; the survivors agree on the lowest live slot
    /// and release both departed slots
    #[test]
    fn simultaneous_departures_heal() {
        for departed in [[0usize, 1], [0, 2], [1, 2]] {
            let net = SimNetwork::new();
            let mut clock = Clock::new();
            let mut nodes = vec![host(&net, MeshConfig::default())];
            for n in 1..=3 {
                nodes.push(guest(&net, n));
                clock.pump(&mut nodes, 10);
            }

            for &slot in &departed {
                nodes[slot].stop();
            }
            let mut survivors: Vec<_> = nodes
                .into_iter()
                .enumerate()
                .filter(|(slot, _)| !departed.contains(slot))
                .map(|(_, node)| node)
                .collect();
            clock.pump(&mut survivors, 10);

            let expected = survivors[0].local_slot().unwrap();
            assert!(survivors[0].is_coordinator(), "{:?}", departed);
            for node in &survivors {
                assert_eq!(node.coordinator_slot(), expected, "{:?}", departed);
                assert!(node.is_mesh_complete(), "{:?} left a stale slot", departed);
                assert_eq!(node.connected_peer_count(), 1);
                for &slot in &departed {
                    assert!(node.peer(slot).is_none());
                }
            }

            let ready = survivors[1]
                .drain_events()
                .into_iter()
                .filter(|event| *event == MeshEvent::MeshComplete)
                .count();
            assert!(ready >= 2, "mesh never re-announced readiness");

            // The lowest freed slot goes to the next joiner
            let port = survivors[0].listen_port();
            let mut newcomer = MeshNetwork::new(net.transport(localhost()), MeshConfig::default());
            newcomer
                .join_mesh(PeerId::from_u128(50), "late", localhost(), port)
                .unwrap();
            survivors.push(newcomer);
            clock.pump(&mut survivors, 10);

            let lowest_free = (0..MAX_PEERS)
                .find(|slot| departed.contains(slot) && *slot != expected)
                .unwrap();
            assert_eq!(survivors[2].local_slot(), Some(lowest_free));
            for node in &survivors {
                assert!(node.is_mesh_complete());
                assert_eq!(node.connected_peer_count(), 2);
            }
        }
    }

    /// Game traffic reaches every peer tagged with the sender's slot
    #[test]
    fn broadcast_reaches_every_peer() {
        let net = SimNetwork::new();
        let mut clock = Clock::new();
        let mut nodes = vec![host(&net, MeshConfig::default())];
        for n in 1..=2 {
            nodes.push(guest(&net, n));
            clock.pump(&mut nodes, 10);
        }
        for node in nodes.iter_mut() {
            node.drain_events();
        }

        nodes[2].broadcast_unreliable(FIRST_GAME_TAG + 1, &[9, 9]);
        clock.pump(&mut nodes, 2);

        for node in &mut nodes[..2] {
            assert_eq!(
                node.drain_events(),
                vec![MeshEvent::MessageReceived {
                    slot: 2,
                    tag: FIRST_GAME_TAG + 1,
                    payload: vec![9, 9],
                }]
            );
        }
        assert!(nodes[2].drain_events().is_empty());
    }
}

/// NAT TRAVERSAL TESTS
mod nat_tests {
    use super::*;

    fn nat_config() -> MeshConfig {
        MeshConfig::default().with_rendezvous(rendezvous_addr())
    }

    /// Host and two joiners behind "NAT" meet through the introducer only
    #[test]
    fn joiners_meet_through_introducer() {
        let net = SimNetwork::new();
        attach_introducer(&net);
        let mut clock = Clock::new();

        let host_id = PeerId::from_u128(1);
        let mut host = MeshNetwork::new(net.transport(ip(1)), nat_config());
        host.start_as_coordinator_with_nat(host_id, "host", HOST_PORT, "match-1")
            .unwrap();
        let mut nodes = vec![host];

        for n in 2..=3u8 {
            let mut joiner = MeshNetwork::new(net.transport(ip(n)), nat_config());
            joiner
                .join_mesh_with_nat(
                    PeerId::from_u128(n as u128),
                    &format!("joiner-{}", n),
                    None,
                    0,
                    "match-1",
                    host_id,
                )
                .unwrap();
            nodes.push(joiner);
            clock.pump(&mut nodes, 20);
        }

        for (slot, node) in nodes.iter().enumerate() {
            assert_eq!(node.local_slot(), Some(slot));
            assert!(node.is_mesh_complete(), "slot {} incomplete", slot);
            assert_eq!(node.connected_peer_count(), 2);
        }

        let introduced = nodes[2].drain_events().into_iter().any(|event| {
            matches!(event, MeshEvent::NatPunchResult { success: true, ref message }
                if message.contains("slot 1"))
        });
        assert!(introduced);
        assert!(!nodes[2].is_punch_pending(1));
        assert!(!nodes[0].is_registering());
    }

    /// No introduction arrives, so the joiner dials the fallback port
    #[test]
    fn punch_timeout_falls_back_to_loopback() {
        let net = SimNetwork::new();
        attach_introducer(&net);
        let mut clock = Clock::new();

        // The host never registers, so the introducer cannot pair anyone
        let mut nodes = vec![host(&net, MeshConfig::default())];
        let mut joiner = MeshNetwork::new(
            net.transport(localhost()),
            nat_config().with_loopback_fallback(true),
        );
        joiner
            .join_mesh_with_nat(
                PeerId::from_u128(2),
                "joiner",
                None,
                HOST_PORT,
                "match-1",
                PeerId::from_u128(1),
            )
            .unwrap();
        nodes.push(joiner);

        clock.pump(&mut nodes, 5);
        assert!(nodes[1].is_waiting_for_coordinator_punch());
        assert_eq!(nodes[1].local_slot(), None);

        clock.advance(Duration::from_secs(11));
        clock.pump(&mut nodes, 10);

        assert!(!nodes[1].is_waiting_for_coordinator_punch());
        assert_eq!(nodes[1].local_slot(), Some(1));
        assert!(nodes[1].is_mesh_complete());

        let events = nodes[1].drain_events();
        assert!(events.contains(&MeshEvent::NatPunchResult {
            success: false,
            message: "introduction to coordinator timed out".to_string(),
        }));
    }

    /// Without loopback fallback a port-only endpoint cannot be dialed
    #[test]
    fn punch_timeout_without_address_rejects_join() {
        let net = SimNetwork::new();
        attach_introducer(&net);
        let mut clock = Clock::new();

        let mut joiner = MeshNetwork::new(net.transport(localhost()), nat_config());
        joiner
            .join_mesh_with_nat(
                PeerId::from_u128(2),
                "joiner",
                None,
                HOST_PORT,
                "match-1",
                PeerId::from_u128(1),
            )
            .unwrap();
        let mut nodes = vec![joiner];

        clock.advance(Duration::from_secs(11));
        clock.pump(&mut nodes, 2);

        assert!(nodes[0].drain_events().contains(&MeshEvent::JoinRejected {
            reason: "no coordinator address known".to_string(),
        }));
    }
}

/// REAL SOCKET TESTS
mod socket_tests {
    use super::*;
    use mesh::UdpTransport;
    use rendezvous::{RendezvousConfig, RendezvousServer, ServerMessage};
    use tokio::time::sleep;

    async fn pump_until<F>(nodes: &mut [MeshNetwork<UdpTransport>], mut done: F) -> bool
    where
        F: FnMut(&mut [MeshNetwork<UdpTransport>]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            for node in nodes.iter_mut() {
                node.poll();
            }
            if done(nodes) {
                return true;
            }
            sleep(Duration::from_millis(5)).await;
        }
        false
    }

    /// Two peers mesh over loopback UDP and exchange a game message
    #[tokio::test]
    async fn mesh_over_udp_loopback() {
        let mut host = MeshNetwork::new(UdpTransport::new(localhost()), MeshConfig::default());
        let port = host
            .start_as_coordinator(PeerId::from_u128(1), "host", 0)
            .unwrap();

        let mut joiner = MeshNetwork::new(UdpTransport::new(localhost()), MeshConfig::default());
        joiner
            .join_mesh(PeerId::from_u128(2), "joiner", localhost(), port)
            .unwrap();

        let mut nodes = vec![host, joiner];
        let meshed = pump_until(&mut nodes, |nodes| {
            nodes.iter().all(|node| node.is_mesh_complete() && node.connected_peer_count() == 1)
        })
        .await;
        assert!(meshed, "peers never formed a mesh");
        for node in nodes.iter_mut() {
            node.drain_events();
        }

        nodes[1].send_reliable(0, FIRST_GAME_TAG, b"ping");
        let expected = MeshEvent::MessageReceived {
            slot: 1,
            tag: FIRST_GAME_TAG,
            payload: b"ping".to_vec(),
        };
        let delivered = pump_until(&mut nodes, |nodes| {
            nodes[0].drain_events().contains(&expected)
        })
        .await;
        assert!(delivered, "game message never arrived");
    }

    /// Host and joiner find each other through a live rendezvous server
    #[tokio::test]
    async fn nat_join_through_rendezvous_server() {
        let mut server = RendezvousServer::bind("127.0.0.1:0", RendezvousConfig::default())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let config = MeshConfig::default().with_rendezvous(server_addr);
        let host_id = PeerId::from_u128(1);

        let mut host = MeshNetwork::new(UdpTransport::new(localhost()), config.clone());
        host.start_as_coordinator_with_nat(host_id, "host", 0, "udp-match")
            .unwrap();

        // Give the registration a head start over the punch request
        let mut nodes = vec![host];
        pump_until(&mut nodes, |nodes| nodes[0].is_registration_confirmed()).await;

        let mut joiner = MeshNetwork::new(UdpTransport::new(localhost()), config);
        joiner
            .join_mesh_with_nat(
                PeerId::from_u128(2),
                "joiner",
                None,
                0,
                "udp-match",
                host_id,
            )
            .unwrap();
        nodes.push(joiner);

        let meshed = pump_until(&mut nodes, |nodes| {
            nodes.iter().all(|node| node.is_mesh_complete() && node.connected_peer_count() == 1)
        })
        .await;
        assert!(meshed, "introduction never produced a mesh");
        assert_eq!(nodes[1].local_slot(), Some(1));

        shutdown.send(ServerMessage::Shutdown).unwrap();
    }
}
