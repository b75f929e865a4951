use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{ChaChaPacketCodec, DecodeError, EncodeError, PacketCodec};

/// Prepended to the associated data of every encrypted packet.
pub const VERSION_INFO: &[u8; 13] = b"NETCODE 1.02\0";
pub const MAX_PACKET_BYTES: usize = 1200;
pub const MAX_PAYLOAD_BYTES: usize = 1100;
pub const USER_DATA_BYTES: usize = 256;
pub const KEY_BYTES: usize = 32;
pub const MAC_BYTES: usize = 16;
pub const PACKET_QUEUE_SIZE: usize = 256;
pub const REPLAY_PROTECTION_BUFFER_SIZE: usize = 256;
pub const MAX_CLIENTS: usize = 256;
pub const NUM_DISCONNECT_PACKETS: usize = 10;

/// Symmetric key used to encrypt packets in one direction
pub type PacketKey = [u8; KEY_BYTES];

/// Numeric packet type carried in the low nibble of the wire prefix byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    KeepAlive = 4,
    Payload = 5,
    Disconnect = 6,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            4 => Some(PacketType::KeepAlive),
            5 => Some(PacketType::Payload),
            6 => Some(PacketType::Disconnect),
            _ => None,
        }
    }
}

/// Logical packet exchanged over an established session, before encryption
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Packet {
    KeepAlive { client_index: u32, max_clients: u32 },
    Payload(Vec<u8>),
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::KeepAlive { .. } => PacketType::KeepAlive,
            Packet::Payload(_) => PacketType::Payload,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}
