//! Server network layer handling UDP communications and session upkeep

use crate::client_manager::ClientManager;
use crate::events::LogObserver;
use crate::session::SessionContext;
use log::{debug, error, info, warn};
use shared::{ChaChaPacketCodec, Packet, MAX_CLIENTS};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

pub const DEFAULT_PROTOCOL_ID: u64 = 0x1122_3344_5566_7788;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub protocol_id: u64,
    pub max_clients: usize,
    pub tick_duration: Duration,
    /// Idle time after which a client is dropped
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol_id: DEFAULT_PROTOCOL_ID,
            max_clients: 64,
            tick_duration: Duration::from_millis(16),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Monotonic seconds since the server started, as used by session timers
#[derive(Debug, Clone, Copy)]
pub struct ServerClock {
    start: Instant,
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { data: Vec<u8>, addr: SocketAddr },
    ClientTimeout { client_index: usize },
    Shutdown,
}

/// Application payload that passed decryption and replay protection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPayload {
    pub client_index: usize,
    pub data: Vec<u8>,
}

/// Main server driving the client sessions
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<ClientManager>,
    clock: ServerClock,
    tick_duration: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    payload_tx: mpsc::UnboundedSender<ReceivedPayload>,
    payload_rx: Option<mpsc::UnboundedReceiver<ReceivedPayload>>,
}

impl Server {
    pub async fn new(addr: &str, config: ServerConfig) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let max_clients = config.max_clients.clamp(1, MAX_CLIENTS);
        if max_clients != config.max_clients {
            warn!(
                "Requested {} clients, using {}",
                config.max_clients, max_clients
            );
        }

        let context = SessionContext::new(
            config.protocol_id,
            Arc::new(ChaChaPacketCodec::new()),
            socket.clone(),
            Arc::new(LogObserver),
        );
        let clients = Arc::new(ClientManager::new(
            max_clients,
            config.timeout.as_secs_f64(),
            &context,
        ));

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (payload_tx, payload_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients,
            clock: ServerClock::new(),
            tick_duration: config.tick_duration,
            server_tx,
            server_rx,
            payload_tx,
            payload_rx: Some(payload_rx),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Shared handle to the client slots, used by the handshake layer to
    /// activate clients and by the application to send to them
    pub fn clients(&self) -> Arc<ClientManager> {
        Arc::clone(&self.clients)
    }

    pub fn clock(&self) -> ServerClock {
        self.clock
    }

    /// Receiver for payloads delivered by clients; can only be taken once
    pub fn take_payloads(&mut self) -> Option<mpsc::UnboundedReceiver<ReceivedPayload>> {
        self.payload_rx.take()
    }

    pub fn message_sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let data = buffer[..len].to_vec();
                        if let Err(e) = server_tx.send(ServerMessage::PacketReceived { data, addr })
                        {
                            error!("Failed to send packet to main loop: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();
        let clock = self.clock;

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                for client_index in clients.check_timeouts(clock.now()) {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_index }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    /// Decrypts an inbound datagram and hands payloads upward
    fn handle_packet(&self, data: &[u8], addr: SocketAddr) {
        let Some((client_index, packet)) = self.clients.process_packet(addr, data, self.clock.now())
        else {
            return;
        };

        match packet {
            Packet::Payload(data) => {
                let payload = ReceivedPayload { client_index, data };
                if self.payload_tx.send(payload).is_err() {
                    debug!("No payload consumer, dropping payload from slot {}", client_index);
                }
            }
            Packet::Disconnect => {
                info!("Client in slot {} requested disconnect", client_index);
            }
            Packet::KeepAlive { .. } => {}
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> io::Result<()> {
        self.spawn_network_receiver();
        self.spawn_timeout_checker();

        let mut tick_interval = interval(self.tick_duration);
        let mut tick: u64 = 0;

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { data, addr }) => {
                            self.handle_packet(&data, addr);
                        },
                        Some(ServerMessage::ClientTimeout { client_index }) => {
                            debug!("Slot {} freed after timeout", client_index);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            self.clients.disconnect_all(self.clock.now());
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    let now = self.clock.now();
                    self.clients.flush_queues(now);
                    self.clients.send_keep_alives(now);
                    tick += 1;

                    // Periodic monitoring
                    if tick % 600 == 0 {
                        let connected = self.clients.connected_count();
                        if connected > 0 {
                            debug!("Tick {}: {} clients connected", tick, connected);
                        }
                    }
                },
            }
        }

        Ok(())
    }
}
