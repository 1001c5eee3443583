//! UDP front end for the introducer

use crate::introducer::Introducer;
use crate::registry::RendezvousConfig;
use log::{debug, error, info};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Messages sent from network tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    DatagramReceived { data: Vec<u8>, addr: SocketAddr },
    RegistrationsExpired { count: usize },
    Shutdown,
}

/// Rendezvous server answering registrations and punch requests
pub struct RendezvousServer {
    socket: Arc<UdpSocket>,
    introducer: Arc<RwLock<Introducer>>,
    expiry_interval: Duration,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl RendezvousServer {
    pub async fn bind(addr: &str, config: RendezvousConfig) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Rendezvous server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Self {
            socket,
            introducer: Arc::new(RwLock::new(Introducer::new(config))),
            expiry_interval: Duration::from_secs(1),
            server_tx,
            server_rx,
            tasks: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender that can stop [`RendezvousServer::run`] from another task
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    pub fn introducer(&self) -> Arc<RwLock<Introducer>> {
        Arc::clone(&self.introducer)
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&mut self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let data = buffer[..len].to_vec();
                        if server_tx
                            .send(ServerMessage::DatagramReceived { data, addr })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        // ICMP port unreachable surfaces here on some platforms
                        debug!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }));
    }

    /// Spawns task that drops registrations past their TTL
    fn spawn_expiry_checker(&mut self) {
        let introducer = Arc::clone(&self.introducer);
        let server_tx = self.server_tx.clone();
        let period = self.expiry_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;

                let count = {
                    let mut introducer = introducer.write().await;
                    introducer.expire(Instant::now())
                };

                if count > 0
                    && server_tx
                        .send(ServerMessage::RegistrationsExpired { count })
                        .is_err()
                {
                    break;
                }
            }
        }));
    }

    async fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        let replies = {
            let mut introducer = self.introducer.write().await;
            introducer.handle_datagram(addr, data, Instant::now())
        };

        for (to, payload) in replies {
            if let Err(e) = self.socket.send_to(&payload, to).await {
                error!("Failed to send to {}: {}", to, e);
            }
        }
    }

    /// Runs until a shutdown message arrives
    pub async fn run(&mut self) -> io::Result<()> {
        self.spawn_network_receiver();
        self.spawn_expiry_checker();

        info!("Rendezvous server started");

        while let Some(message) = self.server_rx.recv().await {
            match message {
                ServerMessage::DatagramReceived { data, addr } => {
                    self.handle_datagram(&data, addr).await;
                }
                ServerMessage::RegistrationsExpired { count } => {
                    let remaining = self.introducer.read().await.table().len();
                    info!("{} registrations expired, {} remaining", count, remaining);
                }
                ServerMessage::Shutdown => break,
            }
        }

        info!("Rendezvous server shutting down");
        for task in self.tasks.drain(..) {
            task.abort();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{RendezvousRequest, RendezvousResponse};
    use tokio::time::timeout;

    async fn start_server(
        config: RendezvousConfig,
    ) -> (SocketAddr, mpsc::UnboundedSender<ServerMessage>) {
        let mut server = RendezvousServer::bind("127.0.0.1:0", config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            let _ = server.run().await;
        });
        (addr, shutdown)
    }

    async fn recv_response(socket: &UdpSocket) -> RendezvousResponse {
        let mut buffer = [0u8; 512];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        RendezvousResponse::decode(&buffer[..len]).unwrap()
    }

    #[test]
    fn test_server_message_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let msg = ServerMessage::DatagramReceived {
            data: vec![1, 2, 3],
            addr,
        };

        match msg {
            ServerMessage::DatagramReceived { data, addr: a } => {
                assert_eq!(data, vec![1, 2, 3]);
                assert_eq!(a, addr);
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[tokio::test]
    async fn test_register_over_udp() {
        let (server_addr, shutdown) = start_server(RendezvousConfig::default()).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let request = RendezvousRequest::Register {
            token: "m:host".to_string(),
        };
        client
            .send_to(&request.encode().unwrap(), server_addr)
            .await
            .unwrap();

        assert_eq!(
            recv_response(&client).await,
            RendezvousResponse::RegisterAck { success: true }
        );

        shutdown.send(ServerMessage::Shutdown).unwrap();
    }

    #[tokio::test]
    async fn test_introduction_over_udp() {
        let (server_addr, shutdown) = start_server(RendezvousConfig::default()).await;
        let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let joiner = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let register = RendezvousRequest::Register {
            token: "m:host".to_string(),
        };
        host.send_to(&register.encode().unwrap(), server_addr)
            .await
            .unwrap();
        recv_response(&host).await;

        let punch = RendezvousRequest::PunchRequest {
            local_token: "m:joiner".to_string(),
            target_token: "m:host".to_string(),
        };
        joiner
            .send_to(&punch.encode().unwrap(), server_addr)
            .await
            .unwrap();

        assert_eq!(
            recv_response(&joiner).await,
            RendezvousResponse::Introduction {
                token: "m:host".to_string(),
                endpoint: host.local_addr().unwrap(),
            }
        );
        assert_eq!(
            recv_response(&host).await,
            RendezvousResponse::Introduction {
                token: "m:joiner".to_string(),
                endpoint: joiner.local_addr().unwrap(),
            }
        );

        shutdown.send(ServerMessage::Shutdown).unwrap();
    }
}
