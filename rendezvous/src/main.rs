use clap::Parser;
use log::info;
use rendezvous::{RendezvousConfig, RendezvousServer, ServerMessage};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Introduces mesh peers behind NAT", long_about = None)]
struct Args {
    /// IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short = 'p', long, default_value = "7000")]
    port: u16,

    /// Seconds a registration survives without a refresh
    #[arg(long, default_value = "60")]
    ttl_secs: u64,

    /// Maximum number of registered tokens
    #[arg(short = 'm', long, default_value = "1024")]
    max_registrations: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = RendezvousConfig {
        ttl: Duration::from_secs(args.ttl_secs),
        max_registrations: args.max_registrations,
    };

    let address = format!("{}:{}", args.host, args.port);
    let mut server = RendezvousServer::bind(&address, config).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            let _ = shutdown.send(ServerMessage::Shutdown);
        }
    });

    server.run().await?;
    Ok(())
}
