use clap::Parser;
use log::{info, warn};
use mesh::{MeshConfig, MeshEvent, MeshNetwork, UdpTransport};
use shared::PeerId;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs one peer of a mesh session", long_about = None)]
struct Args {
    /// Display name announced to other peers
    #[arg(short = 'n', long, default_value = "peer")]
    name: String,

    /// Port to listen on; 0 picks a free port
    #[arg(short = 'p', long, default_value = "7777")]
    port: u16,

    /// Coordinator address to join; omit to host
    #[arg(short = 'j', long)]
    join: Option<SocketAddr>,

    /// Rendezvous server used for NAT introductions
    #[arg(short = 'r', long)]
    rendezvous: Option<SocketAddr>,

    /// Match identifier registered with the rendezvous server
    #[arg(short = 'm', long)]
    match_id: Option<String>,

    /// Identity of the coordinator when joining through the rendezvous server
    #[arg(long)]
    host_id: Option<PeerId>,

    /// Identity of this peer; random when omitted
    #[arg(long)]
    id: Option<PeerId>,

    /// Poll interval in milliseconds
    #[arg(short = 't', long, default_value = "16")]
    tick_ms: u64,

    /// Dial 127.0.0.1 when only a peer's port is known
    #[arg(long)]
    loopback_fallback: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = MeshConfig::default().with_loopback_fallback(args.loopback_fallback);
    if let Some(rendezvous) = args.rendezvous {
        config = config.with_rendezvous(rendezvous);
    }

    let identity = args.id.unwrap_or_else(PeerId::random);
    info!("Peer identity: {}", identity);

    let mut mesh = MeshNetwork::new(UdpTransport::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), config);
    let port = match (args.join, args.host_id, args.match_id.as_deref()) {
        (None, None, None) => mesh.start_as_coordinator(identity, &args.name, args.port)?,
        (None, None, Some(match_id)) => {
            mesh.start_as_coordinator_with_nat(identity, &args.name, args.port, match_id)?
        }
        (join, Some(host_id), Some(match_id)) => mesh.join_mesh_with_nat(
            identity,
            &args.name,
            join.map(|addr| addr.ip()),
            join.map(|addr| addr.port()).unwrap_or(0),
            match_id,
            host_id,
        )?,
        (Some(join), _, _) => mesh.join_mesh(identity, &args.name, join.ip(), join.port())?,
        (None, Some(_), None) => {
            return Err("--host-id needs --match-id to join through the rendezvous server".into())
        }
    };
    info!("{} listening on port {}", args.name, port);

    let mut ticker = interval(Duration::from_millis(args.tick_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                mesh.poll();
                for event in mesh.drain_events() {
                    log_event(&event);
                    match event {
                        MeshEvent::MeshComplete => mesh.set_local_ready(true),
                        MeshEvent::JoinRejected { .. } => {
                            mesh.stop();
                            return Err("could not join the mesh".into());
                        }
                        _ => {}
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    mesh.stop();
    Ok(())
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::PeerConnected { slot } => info!("Slot {} connected", slot),
        MeshEvent::PeerDisconnected { slot } => info!("Slot {} disconnected", slot),
        MeshEvent::PeerJoinReceived {
            slot, display_name, ..
        } => info!("{} joined as slot {}", display_name, slot),
        MeshEvent::JoinRejected { reason } => warn!("Join rejected: {}", reason),
        MeshEvent::PeerListReceived { peers } => {
            let names: Vec<String> = peers
                .iter()
                .map(|peer| format!("{}={}", peer.slot, peer.display_name))
                .collect();
            info!("Peer list: {}", names.join(", "));
        }
        MeshEvent::CoordinatorChanged { slot } => info!("Coordinator is now slot {}", slot),
        MeshEvent::NatPunchResult { success, message } => {
            if *success {
                info!("NAT: {}", message);
            } else {
                warn!("NAT: {}", message);
            }
        }
        MeshEvent::MessageReceived { slot, tag, payload } => {
            info!("Slot {} sent tag {} ({} bytes)", slot, tag, payload.len())
        }
        other => info!("{:?}", other),
    }
}
