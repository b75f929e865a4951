//! Client slot pool for the session layer
//!
//! This module owns the fixed set of client sessions the server can host:
//! - Slot activation when an external handshake hands over a client
//! - Address and id lookup for routing inbound datagrams
//! - Key lookup for encrypting and decrypting per-slot traffic
//! - Keep-alives, queued packet flushing and timeout sweeps
//!
//! Slots are allocated once and never destroyed while the server runs. A
//! disconnect or timeout clears the slot so the next client starts from a
//! blank session.

use crate::encryption::{EncryptionManager, SessionKeys};
use crate::packet_queue::QueueFull;
use crate::session::{Activation, ClientSession, ReceiveError, SendError, SessionContext};
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{Packet, NUM_DISCONNECT_PACKETS, USER_DATA_BYTES};
use std::net::SocketAddr;
use thiserror::Error;

/// Seconds between keep-alive packets on an otherwise idle session
pub const KEEP_ALIVE_INTERVAL: f64 = 0.1;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no connected client in slot {0}")]
    NoSuchClient(usize),

    #[error(transparent)]
    QueueFull(#[from] QueueFull),

    #[error(transparent)]
    Send(#[from] SendError),
}

/// Manages every client slot and the keys bound to them
///
/// Administrative operations (connect, disconnect, timeouts) serialize on the
/// key table lock. Sending and receiving only take it long enough to copy the
/// keys for one slot.
pub struct ClientManager {
    sessions: Vec<ClientSession>,
    encryption: Mutex<EncryptionManager>,
    timeout: f64,
}

impl ClientManager {
    /// Pre-allocates `max_clients` free sessions
    ///
    /// `timeout` is the number of seconds without an accepted packet after
    /// which a client is dropped by [`ClientManager::check_timeouts`].
    pub fn new(max_clients: usize, timeout: f64, context: &SessionContext) -> Self {
        Self {
            sessions: (0..max_clients)
                .map(|_| ClientSession::new(context))
                .collect(),
            encryption: Mutex::new(EncryptionManager::new(max_clients)),
            timeout,
        }
    }

    /// Binds a free slot to an authenticated client
    ///
    /// Returns the slot index, or None when the server is full or the address
    /// or client id is already connected.
    pub fn connect_client(
        &self,
        address: SocketAddr,
        client_id: u64,
        keys: SessionKeys,
        user_data: [u8; USER_DATA_BYTES],
        now: f64,
    ) -> Option<usize> {
        let mut encryption = self.encryption.lock();

        if self.find_client_by_addr(address).is_some() {
            warn!("Client at {} is already connected", address);
            return None;
        }
        if self.find_client_by_id(client_id).is_some() {
            warn!("Client id {:#x} is already connected", client_id);
            return None;
        }

        let Some(client_index) = self.sessions.iter().position(|s| s.is_free()) else {
            warn!("Server full, refusing client {:#x} from {}", client_id, address);
            return None;
        };

        // Key entries belong to the slot and are released only by a disconnect,
        // so a key slot can never be handed out while a session still uses it
        let Some(encryption_index) = encryption.add(address, keys, now, -1.0) else {
            warn!("No key slot available for client {:#x}", client_id);
            return None;
        };

        self.sessions[client_index].activate(
            Activation {
                client_index,
                client_id,
                encryption_index,
                address,
                user_data,
            },
            now,
        );

        info!(
            "Client {:#x} connected from {} in slot {}",
            client_id, address, client_index
        );
        Some(client_index)
    }

    /// Sends redundant disconnect packets, then frees the slot
    pub fn disconnect_client(&self, client_index: usize, now: f64) -> bool {
        let mut encryption = self.encryption.lock();
        self.disconnect_locked(&mut encryption, client_index, true, now)
    }

    /// Disconnects every connected client, sending each the redundant
    /// disconnect packets before its slot is freed
    ///
    /// Used on shutdown so clients learn immediately instead of timing out.
    pub fn disconnect_all(&self, now: f64) {
        let mut encryption = self.encryption.lock();
        for client_index in 0..self.sessions.len() {
            self.disconnect_locked(&mut encryption, client_index, true, now);
        }
    }

    fn disconnect_locked(
        &self,
        encryption: &mut EncryptionManager,
        client_index: usize,
        notify: bool,
        now: f64,
    ) -> bool {
        let Some(session) = self.connected_session(client_index) else {
            return false;
        };

        if notify {
            if let Some(keys) = session
                .encryption_index()
                .and_then(|index| encryption.keys(index))
            {
                for _ in 0..NUM_DISCONNECT_PACKETS {
                    if let Err(e) = session.send_packet(&Packet::Disconnect, &keys.send_key, now) {
                        warn!("Failed to send disconnect to slot {}: {}", client_index, e);
                        break;
                    }
                }
            }
        }

        if let Some(index) = session.encryption_index() {
            encryption.remove(index);
        }
        session.clear();

        info!("Client in slot {} disconnected", client_index);
        true
    }

    /// Finds the slot connected from the given address
    pub fn find_client_by_addr(&self, address: SocketAddr) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.is_connected() && s.address() == Some(address))
    }

    /// Finds the slot occupied by the given client id
    ///
    /// Only connected slots are considered; a cleared slot keeps no identity.
    pub fn find_client_by_id(&self, client_id: u64) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.is_connected() && s.client_id() == client_id)
    }

    /// Gets the session in a slot, whether or not it is connected
    ///
    /// Returns None only when the index is outside the pool.
    pub fn session(&self, client_index: usize) -> Option<&ClientSession> {
        self.sessions.get(client_index)
    }

    fn connected_session(&self, client_index: usize) -> Option<&ClientSession> {
        self.sessions
            .get(client_index)
            .filter(|session| session.is_connected())
    }

    fn keys_for(&self, session: &ClientSession) -> Option<SessionKeys> {
        let index = session.encryption_index()?;
        self.encryption.lock().keys(index).cloned()
    }

    /// Encrypts and sends a packet to one client immediately
    pub fn send_packet(
        &self,
        client_index: usize,
        packet: &Packet,
        now: f64,
    ) -> Result<(), ClientError> {
        let session = self
            .connected_session(client_index)
            .ok_or(ClientError::NoSuchClient(client_index))?;
        let keys = self
            .keys_for(session)
            .ok_or(ClientError::NoSuchClient(client_index))?;

        session.send_packet(packet, &keys.send_key, now)?;
        Ok(())
    }

    /// Buffers a packet for the next flush; a full queue is reported back
    pub fn queue_packet(&self, client_index: usize, packet: Packet) -> Result<(), ClientError> {
        let session = self
            .connected_session(client_index)
            .ok_or(ClientError::NoSuchClient(client_index))?;

        session.queue_packet(packet)?;
        Ok(())
    }

    /// Sends all queued packets for every connected client
    pub fn flush_queues(&self, now: f64) -> usize {
        let mut sent = 0;
        for session in self.sessions.iter().filter(|s| s.is_connected()) {
            if session.queue_len() == 0 {
                continue;
            }
            if let Some(keys) = self.keys_for(session) {
                sent += session.flush_queue(&keys.send_key, now);
            }
        }
        sent
    }

    /// Sends a keep-alive to every client that has been idle for a send interval
    pub fn send_keep_alives(&self, now: f64) -> usize {
        let max_clients = self.sessions.len() as u32;
        let mut sent = 0;

        for (client_index, session) in self.sessions.iter().enumerate() {
            if !session.is_connected() || session.last_send_time() + KEEP_ALIVE_INTERVAL > now {
                continue;
            }
            let Some(keys) = self.keys_for(session) else {
                continue;
            };

            let packet = Packet::KeepAlive {
                client_index: client_index as u32,
                max_clients,
            };
            match session.send_packet(&packet, &keys.send_key, now) {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to send keep-alive to slot {}: {}", client_index, e),
            }
        }
        sent
    }

    /// Routes an inbound datagram to the session bound to its source address
    ///
    /// Returns the slot index and packet when the datagram authenticated and
    /// passed replay protection. Everything else is dropped here. A received
    /// disconnect frees the slot.
    pub fn process_packet(
        &self,
        address: SocketAddr,
        data: &[u8],
        now: f64,
    ) -> Option<(usize, Packet)> {
        let Some(client_index) = self.find_client_by_addr(address) else {
            debug!("Dropping {} bytes from unknown address {}", data.len(), address);
            return None;
        };
        let session = &self.sessions[client_index];
        let keys = self.keys_for(session)?;

        let packet = match session.process_packet(data, &keys.receive_key, now) {
            Ok(packet) => packet,
            Err(ReceiveError::ReplayRejected { sequence }) => {
                debug!("Replayed packet {} from slot {} ignored", sequence, client_index);
                return None;
            }
            Err(e) => {
                debug!("Dropping packet from slot {}: {}", client_index, e);
                return None;
            }
        };

        if let Some(index) = session.encryption_index() {
            self.encryption.lock().touch(index, now);
        }

        if packet == Packet::Disconnect {
            let mut encryption = self.encryption.lock();
            self.disconnect_locked(&mut encryption, client_index, false, now);
        }

        Some((client_index, packet))
    }

    /// Clears every session that has not received a packet within the timeout
    ///
    /// Returns the freed slot indices so other systems can drop their state.
    pub fn check_timeouts(&self, now: f64) -> Vec<usize> {
        let mut encryption = self.encryption.lock();
        let timed_out: Vec<usize> = self
            .sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_connected() && s.last_recv_time() + self.timeout < now)
            .map(|(index, _)| index)
            .collect();

        for &client_index in &timed_out {
            info!("Client in slot {} timed out", client_index);
            self.disconnect_locked(&mut encryption, client_index, false, now);
        }

        timed_out
    }

    /// Returns the number of currently connected clients
    pub fn connected_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_connected()).count()
    }

    /// Checks whether every slot is occupied
    ///
    /// A full server refuses new clients until a slot is disconnected or
    /// times out.
    pub fn is_full(&self) -> bool {
        self.sessions.iter().all(|s| !s.is_free())
    }

    /// Returns the number of pre-allocated slots
    ///
    /// This is fixed when the manager is created.
    pub fn max_clients(&self) -> usize {
        self.sessions.len()
    }

    /// Gets all slot indices and addresses of connected clients
    pub fn client_addrs(&self) -> Vec<(usize, SocketAddr)> {
        self.sessions
            .iter()
            .enumerate()
            .filter_map(|(index, s)| s.address().map(|addr| (index, addr)))
            .collect()
    }
}
