//! Per-client secure session slot
//!
//! A [`ClientSession`] is allocated once when the server starts and reused for
//! every client that occupies its slot. It owns the outbound sequence counter,
//! the inbound replay filter and a bounded queue of packets waiting to be sent.
//!
//! State is split by the path that writes it:
//! - the binding (identity, address, connection flags) is changed by
//!   activation and [`ClientSession::clear`] and read by the hot paths,
//! - the send state (sequence, last send time, scratch buffer, queue) is only
//!   written by the send path,
//! - the receive state (replay filter, last receive time) is only written by
//!   the receive path.
//!
//! Locks are always taken in that order. Sending holds the binding read lock
//! for its whole duration, so a concurrent clear either completes before the
//! send starts or waits until it has finished.

use crate::events::{SessionEvent, SessionObserver};
use crate::packet_queue::{PacketQueue, QueueFull};
use crate::replay::ReplayFilter;
use crate::transport::Transport;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use shared::{
    DecodeError, EncodeError, Packet, PacketCodec, PacketKey, MAX_PACKET_BYTES,
    PACKET_QUEUE_SIZE, REPLAY_PROTECTION_BUFFER_SIZE, USER_DATA_BYTES,
};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("unable to encode packet: {0}")]
    EncodeFailed(#[from] EncodeError),

    #[error("sequence numbers exhausted for this session")]
    SequenceExhausted,
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("session is not connected")]
    NotConnected,

    #[error("unable to decode packet: {0}")]
    DecodeFailed(#[from] DecodeError),

    #[error("sequence {sequence} was already received or is too old")]
    ReplayRejected { sequence: u64 },
}

/// Collaborators and sizing shared by every session in a pool
#[derive(Clone)]
pub struct SessionContext {
    pub protocol_id: u64,
    pub codec: Arc<dyn PacketCodec>,
    pub transport: Arc<dyn Transport>,
    pub observer: Arc<dyn SessionObserver>,
    pub queue_capacity: usize,
    pub replay_window: usize,
}

impl SessionContext {
    pub fn new(
        protocol_id: u64,
        codec: Arc<dyn PacketCodec>,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            protocol_id,
            codec,
            transport,
            observer,
            queue_capacity: PACKET_QUEUE_SIZE,
            replay_window: REPLAY_PROTECTION_BUFFER_SIZE,
        }
    }
}

/// What the allocator assigns when a client takes over a free slot
#[derive(Debug, Clone)]
pub struct Activation {
    pub client_index: usize,
    pub client_id: u64,
    pub encryption_index: usize,
    pub address: SocketAddr,
    pub user_data: [u8; USER_DATA_BYTES],
}

struct Binding {
    client_id: u64,
    client_index: Option<usize>,
    encryption_index: Option<usize>,
    address: Option<SocketAddr>,
    connected: bool,
    confirmed: bool,
    user_data: Box<[u8; USER_DATA_BYTES]>,
}

struct SendState {
    sequence: u64,
    last_send_time: f64,
    packet_data: Box<[u8; MAX_PACKET_BYTES]>,
    queue: PacketQueue<Packet>,
}

struct RecvState {
    replay: ReplayFilter,
    last_recv_time: f64,
}

impl Binding {
    fn free() -> Self {
        Self {
            client_id: 0,
            client_index: None,
            encryption_index: None,
            address: None,
            connected: false,
            confirmed: false,
            user_data: Box::new([0u8; USER_DATA_BYTES]),
        }
    }

    fn reset(&mut self) {
        self.client_id = 0;
        self.client_index = None;
        self.encryption_index = None;
        self.address = None;
        self.connected = false;
        self.confirmed = false;
        self.user_data.fill(0);
    }
}

impl SendState {
    fn reset(&mut self) {
        self.sequence = 0;
        self.last_send_time = 0.0;
        self.packet_data.fill(0);
        self.queue.clear();
    }
}

impl RecvState {
    fn reset(&mut self) {
        self.replay.reset();
        self.last_recv_time = 0.0;
    }
}

pub struct ClientSession {
    protocol_id: u64,
    codec: Arc<dyn PacketCodec>,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn SessionObserver>,
    binding: RwLock<Binding>,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
}

impl ClientSession {
    /// Creates a session in the free state
    pub fn new(context: &SessionContext) -> Self {
        Self {
            protocol_id: context.protocol_id,
            codec: Arc::clone(&context.codec),
            transport: Arc::clone(&context.transport),
            observer: Arc::clone(&context.observer),
            binding: RwLock::new(Binding::free()),
            send: Mutex::new(SendState {
                sequence: 0,
                last_send_time: 0.0,
                packet_data: Box::new([0u8; MAX_PACKET_BYTES]),
                queue: PacketQueue::new(context.queue_capacity),
            }),
            recv: Mutex::new(RecvState {
                replay: ReplayFilter::new(context.replay_window),
                last_recv_time: 0.0,
            }),
        }
    }

    /// Binds the slot to a newly authenticated client
    ///
    /// Sequence, replay history and queue start from scratch so nothing from a
    /// previous occupant carries over, even if the slot was not cleared.
    pub fn activate(&self, activation: Activation, server_time: f64) {
        let mut binding = self.binding.write();
        let mut send = self.send.lock();
        let mut recv = self.recv.lock();

        binding.reset();
        send.reset();
        recv.reset();

        binding.client_id = activation.client_id;
        binding.client_index = Some(activation.client_index);
        binding.encryption_index = Some(activation.encryption_index);
        binding.address = Some(activation.address);
        binding.connected = true;
        *binding.user_data = activation.user_data;
        send.last_send_time = server_time;
        recv.last_recv_time = server_time;
    }

    /// Marks the client as having proven it holds the session keys
    pub fn confirm(&self) {
        let mut binding = self.binding.write();
        if binding.connected {
            binding.confirmed = true;
        }
    }

    /// Returns the slot to the free state; calling it on a free slot is harmless
    pub fn clear(&self) {
        let event = {
            let mut binding = self.binding.write();
            let mut send = self.send.lock();
            let mut recv = self.recv.lock();

            let event = SessionEvent::Cleared {
                client_index: binding.client_index,
                address: binding.address,
                last_send_time: send.last_send_time,
                last_recv_time: recv.last_recv_time,
            };

            binding.reset();
            send.reset();
            recv.reset();
            event
        };

        self.observer.on_event(&event);
    }

    /// Encrypts `packet` under the next sequence number and writes it out
    ///
    /// Only an encoding failure or an exhausted sequence is reported, and
    /// either leaves the session untouched. Otherwise the sequence is consumed even if nothing reaches
    /// the wire: the ciphertext for that value already exists and must never
    /// be produced again for different content under the same key.
    pub fn send_packet(
        &self,
        packet: &Packet,
        write_key: &PacketKey,
        server_time: f64,
    ) -> Result<(), SendError> {
        let event = {
            let binding = self.binding.read();
            let mut send = self.send.lock();
            self.send_locked(&binding, &mut send, packet, write_key, server_time)?
        };

        if let Some(event) = event {
            self.observer.on_event(&event);
        }
        Ok(())
    }

    fn send_locked(
        &self,
        binding: &Binding,
        send: &mut SendState,
        packet: &Packet,
        write_key: &PacketKey,
        server_time: f64,
    ) -> Result<Option<SessionEvent>, SendError> {
        let next_sequence = send
            .sequence
            .checked_add(1)
            .ok_or(SendError::SequenceExhausted)?;
        let written = self.codec.encode(
            packet,
            &mut send.packet_data[..],
            self.protocol_id,
            send.sequence,
            write_key,
        )?;

        let event = match binding.address {
            None => Some(SessionEvent::SendWithoutAddress {
                client_index: binding.client_index,
                sequence: send.sequence,
            }),
            Some(address) => match self
                .transport
                .send_to(&send.packet_data[..written], address)
            {
                Ok(_) => None,
                Err(e) => Some(SessionEvent::TransportFailed {
                    client_index: binding.client_index,
                    address,
                    sequence: send.sequence,
                    kind: e.kind(),
                }),
            },
        };

        send.sequence = next_sequence;
        send.last_send_time = server_time;
        Ok(event)
    }

    /// Buffers a packet for the next [`ClientSession::flush_queue`]
    pub fn queue_packet(&self, packet: Packet) -> Result<(), QueueFull> {
        self.send.lock().queue.push(packet)
    }

    /// Sends every queued packet in order, returning how many were encoded
    pub fn flush_queue(&self, write_key: &PacketKey, server_time: f64) -> usize {
        let mut events = Vec::new();
        let mut sent = 0;
        {
            let binding = self.binding.read();
            let mut send = self.send.lock();

            while let Some(packet) = send.queue.pop() {
                match self.send_locked(&binding, &mut send, &packet, write_key, server_time) {
                    Ok(event) => {
                        sent += 1;
                        events.extend(event);
                    }
                    Err(e) => events.push(SessionEvent::QueuedPacketDropped {
                        client_index: binding.client_index,
                        reason: e.to_string(),
                    }),
                }
            }
        }

        for event in &events {
            self.observer.on_event(event);
        }
        sent
    }

    /// Authenticates an inbound datagram and filters replays
    ///
    /// The packet is only returned once its sequence has passed the replay
    /// filter. The first accepted packet confirms the session. The binding is
    /// held upgradable for the whole call so a concurrent clear cannot hand
    /// the confirmation to the next occupant.
    pub fn process_packet(
        &self,
        data: &[u8],
        read_key: &PacketKey,
        server_time: f64,
    ) -> Result<Packet, ReceiveError> {
        let binding = self.binding.upgradable_read();
        if !binding.connected {
            return Err(ReceiveError::NotConnected);
        }

        let (sequence, packet) = self.codec.decode(data, self.protocol_id, read_key)?;

        {
            let mut recv = self.recv.lock();
            if !recv.replay.check_and_insert(sequence) {
                return Err(ReceiveError::ReplayRejected { sequence });
            }
            recv.last_recv_time = server_time;
        }

        if !binding.confirmed {
            RwLockUpgradableReadGuard::upgrade(binding).confirmed = true;
        }
        Ok(packet)
    }

    pub fn protocol_id(&self) -> u64 {
        self.protocol_id
    }

    pub fn client_id(&self) -> u64 {
        self.binding.read().client_id
    }

    pub fn client_index(&self) -> Option<usize> {
        self.binding.read().client_index
    }

    pub fn encryption_index(&self) -> Option<usize> {
        self.binding.read().encryption_index
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.binding.read().address
    }

    pub fn is_connected(&self) -> bool {
        self.binding.read().connected
    }

    pub fn is_confirmed(&self) -> bool {
        self.binding.read().confirmed
    }

    pub fn is_free(&self) -> bool {
        self.binding.read().client_index.is_none()
    }

    pub fn user_data(&self) -> [u8; USER_DATA_BYTES] {
        *self.binding.read().user_data
    }

    pub fn sequence(&self) -> u64 {
        self.send.lock().sequence
    }

    pub fn last_send_time(&self) -> f64 {
        self.send.lock().last_send_time
    }

    pub fn queue_len(&self) -> usize {
        self.send.lock().queue.len()
    }

    pub fn is_queue_full(&self) -> bool {
        self.send.lock().queue.is_full()
    }

    pub fn last_recv_time(&self) -> f64 {
        self.recv.lock().last_recv_time
    }
}
