//! Encrypted packet encoding for established sessions
//!
//! Every packet on the wire has the layout:
//!
//! ```text
//! [prefix: u8][sequence: 1..=8 bytes LE][ciphertext][tag: 16 bytes]
//! ```
//!
//! The low nibble of the prefix is the packet type and the high nibble is the
//! number of sequence bytes that follow. The body is the bincode encoding of
//! the [`Packet`], sealed with ChaCha20-Poly1305. The nonce is derived from the
//! sequence number and the associated data binds the protocol version, the
//! protocol id and the prefix byte, so any of them being altered in transit
//! fails authentication.

use crate::{Packet, PacketKey, PacketType, MAC_BYTES, MAX_PACKET_BYTES, MAX_PAYLOAD_BYTES, VERSION_INFO};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use thiserror::Error;

const ASSOCIATED_DATA_BYTES: usize = VERSION_INFO.len() + 8 + 1;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("payload of {size} bytes exceeds the maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("encoded packet of {size} bytes exceeds the maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("buffer of {available} bytes cannot hold {needed} encoded bytes")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("failed to serialize packet body: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("failed to encrypt packet body")]
    Encryption,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("packet of {len} bytes is too short")]
    TooShort { len: usize },

    #[error("packet of {len} bytes exceeds the maximum of {max}")]
    Oversized { len: usize, max: usize },

    #[error("invalid prefix byte {0:#04x}")]
    InvalidPrefix(u8),

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("packet failed authentication")]
    Authentication,

    #[error("malformed packet body: {0}")]
    Malformed(#[from] bincode::Error),

    #[error("prefix declares {declared:?} but body holds {actual:?}")]
    TypeMismatch {
        declared: PacketType,
        actual: PacketType,
    },
}

/// Converts logical packets to and from authenticated ciphertext
pub trait PacketCodec: Send + Sync {
    /// Writes the encrypted form of `packet` into `buffer`, returning the number
    /// of bytes written. Nothing is written when an error is returned.
    fn encode(
        &self,
        packet: &Packet,
        buffer: &mut [u8],
        protocol_id: u64,
        sequence: u64,
        key: &PacketKey,
    ) -> Result<usize, EncodeError>;

    /// Verifies and decrypts `data`, returning the sequence number it was sealed
    /// under together with the packet.
    fn decode(
        &self,
        data: &[u8],
        protocol_id: u64,
        key: &PacketKey,
    ) -> Result<(u64, Packet), DecodeError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChaChaPacketCodec;

impl ChaChaPacketCodec {
    pub fn new() -> Self {
        Self
    }
}

/// Minimal number of bytes needed to represent `sequence`, never less than one
fn sequence_bytes_required(sequence: u64) -> usize {
    let bits = 64 - sequence.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

/// Format: 0x00000000 (4 bytes) || sequence (8 bytes LE)
fn build_nonce(sequence: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

fn associated_data(protocol_id: u64, prefix: u8) -> [u8; ASSOCIATED_DATA_BYTES] {
    let mut aad = [0u8; ASSOCIATED_DATA_BYTES];
    aad[..VERSION_INFO.len()].copy_from_slice(VERSION_INFO);
    aad[VERSION_INFO.len()..VERSION_INFO.len() + 8].copy_from_slice(&protocol_id.to_le_bytes());
    aad[ASSOCIATED_DATA_BYTES - 1] = prefix;
    aad
}

impl PacketCodec for ChaChaPacketCodec {
    fn encode(
        &self,
        packet: &Packet,
        buffer: &mut [u8],
        protocol_id: u64,
        sequence: u64,
        key: &PacketKey,
    ) -> Result<usize, EncodeError> {
        if let Packet::Payload(payload) = packet {
            if payload.len() > MAX_PAYLOAD_BYTES {
                return Err(EncodeError::PayloadTooLarge {
                    size: payload.len(),
                    max: MAX_PAYLOAD_BYTES,
                });
            }
        }

        let body = bincode::serialize(packet)?;

        let sequence_bytes = sequence_bytes_required(sequence);
        let prefix = (packet.packet_type() as u8) | ((sequence_bytes as u8) << 4);
        let header_len = 1 + sequence_bytes;
        let body_end = header_len + body.len();
        let total = body_end + MAC_BYTES;

        if total > MAX_PACKET_BYTES {
            return Err(EncodeError::PacketTooLarge {
                size: total,
                max: MAX_PACKET_BYTES,
            });
        }
        if total > buffer.len() {
            return Err(EncodeError::BufferTooSmall {
                needed: total,
                available: buffer.len(),
            });
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let nonce = build_nonce(sequence);
        let aad = associated_data(protocol_id, prefix);

        buffer[0] = prefix;
        buffer[1..header_len].copy_from_slice(&sequence.to_le_bytes()[..sequence_bytes]);
        buffer[header_len..body_end].copy_from_slice(&body);

        let tag = cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                &aad,
                &mut buffer[header_len..body_end],
            )
            .map_err(|_| EncodeError::Encryption)?;
        buffer[body_end..total].copy_from_slice(tag.as_slice());

        Ok(total)
    }

    fn decode(
        &self,
        data: &[u8],
        protocol_id: u64,
        key: &PacketKey,
    ) -> Result<(u64, Packet), DecodeError> {
        if data.len() > MAX_PACKET_BYTES {
            return Err(DecodeError::Oversized {
                len: data.len(),
                max: MAX_PACKET_BYTES,
            });
        }
        let Some(&prefix) = data.first() else {
            return Err(DecodeError::TooShort { len: 0 });
        };

        let declared = PacketType::from_u8(prefix & 0x0f)
            .ok_or(DecodeError::UnknownPacketType(prefix & 0x0f))?;
        let sequence_bytes = (prefix >> 4) as usize;
        if !(1..=8).contains(&sequence_bytes) {
            return Err(DecodeError::InvalidPrefix(prefix));
        }

        let header_len = 1 + sequence_bytes;
        if data.len() < header_len + MAC_BYTES {
            return Err(DecodeError::TooShort { len: data.len() });
        }

        let mut raw_sequence = [0u8; 8];
        raw_sequence[..sequence_bytes].copy_from_slice(&data[1..header_len]);
        let sequence = u64::from_le_bytes(raw_sequence);

        let body_end = data.len() - MAC_BYTES;
        let mut body = data[header_len..body_end].to_vec();
        let tag = Tag::from_slice(&data[body_end..]);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let nonce = build_nonce(sequence);
        let aad = associated_data(protocol_id, prefix);
        cipher
            .decrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut body, tag)
            .map_err(|_| DecodeError::Authentication)?;

        let packet: Packet = bincode::deserialize(&body)?;
        if packet.packet_type() != declared {
            return Err(DecodeError::TypeMismatch {
                declared,
                actual: packet.packet_type(),
            });
        }

        Ok((sequence, packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    const PROTOCOL_ID: u64 = 0x1122_3344_5566_7788;

    fn random_key() -> PacketKey {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_sequence_bytes_required() {
        assert_eq!(sequence_bytes_required(0), 1);
        assert_eq!(sequence_bytes_required(0xff), 1);
        assert_eq!(sequence_bytes_required(0x100), 2);
        assert_eq!(sequence_bytes_required(0xff_ffff), 3);
        assert_eq!(sequence_bytes_required(u64::MAX), 8);
    }

    #[test]
    fn test_encode_decode_payload() {
        let codec = ChaChaPacketCodec::new();
        let key = random_key();
        let mut buffer = [0u8; MAX_PACKET_BYTES];
        let packet = Packet::Payload(b"hello world".to_vec());

        let written = codec
            .encode(&packet, &mut buffer, PROTOCOL_ID, 1000, &key)
            .unwrap();
        assert_eq!(buffer[0] & 0x0f, PacketType::Payload as u8);
        assert_eq!(buffer[0] >> 4, 2);

        let (sequence, decoded) = codec.decode(&buffer[..written], PROTOCOL_ID, &key).unwrap();
        assert_eq!(sequence, 1000);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let codec = ChaChaPacketCodec::new();
        let key = random_key();
        let packet = Packet::KeepAlive {
            client_index: 7,
            max_clients: 64,
        };

        let mut first = [0u8; MAX_PACKET_BYTES];
        let mut second = [0u8; MAX_PACKET_BYTES];
        let a = codec.encode(&packet, &mut first, PROTOCOL_ID, 5, &key).unwrap();
        let b = codec.encode(&packet, &mut second, PROTOCOL_ID, 5, &key).unwrap();

        assert_eq!(a, b);
        assert_eq!(first[..a], second[..b]);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let codec = ChaChaPacketCodec::new();
        let key = random_key();
        let mut buffer = [0xaau8; MAX_PACKET_BYTES];
        let packet = Packet::Payload(vec![0u8; MAX_PAYLOAD_BYTES + 1]);

        let result = codec.encode(&packet, &mut buffer, PROTOCOL_ID, 0, &key);
        assert!(matches!(result, Err(EncodeError::PayloadTooLarge { .. })));
        assert!(buffer.iter().all(|b| *b == 0xaa));
    }

    #[test]
    fn test_encode_rejects_small_buffer() {
        let codec = ChaChaPacketCodec::new();
        let key = random_key();
        let mut buffer = [0u8; 8];

        let result = codec.encode(&Packet::Disconnect, &mut buffer, PROTOCOL_ID, 0, &key);
        assert!(matches!(result, Err(EncodeError::BufferTooSmall { .. })));
    }

    #[test]
    fn test_decode_rejects_wrong_key() {
        let codec = ChaChaPacketCodec::new();
        let mut buffer = [0u8; MAX_PACKET_BYTES];
        let written = codec
            .encode(&Packet::Disconnect, &mut buffer, PROTOCOL_ID, 3, &random_key())
            .unwrap();

        let result = codec.decode(&buffer[..written], PROTOCOL_ID, &random_key());
        assert!(matches!(result, Err(DecodeError::Authentication)));
    }

    #[test]
    fn test_decode_rejects_wrong_protocol_id() {
        let codec = ChaChaPacketCodec::new();
        let key = random_key();
        let mut buffer = [0u8; MAX_PACKET_BYTES];
        let written = codec
            .encode(&Packet::Disconnect, &mut buffer, PROTOCOL_ID, 3, &key)
            .unwrap();

        let result = codec.decode(&buffer[..written], PROTOCOL_ID + 1, &key);
        assert!(matches!(result, Err(DecodeError::Authentication)));
    }

    #[test]
    fn test_decode_rejects_tampered_sequence() {
        let codec = ChaChaPacketCodec::new();
        let key = random_key();
        let mut buffer = [0u8; MAX_PACKET_BYTES];
        let written = codec
            .encode(&Packet::Payload(vec![1, 2, 3]), &mut buffer, PROTOCOL_ID, 9, &key)
            .unwrap();

        buffer[1] ^= 0x01;
        let result = codec.decode(&buffer[..written], PROTOCOL_ID, &key);
        assert!(matches!(result, Err(DecodeError::Authentication)));
    }

    #[test]
    fn test_decode_rejects_tampered_type() {
        let codec = ChaChaPacketCodec::new();
        let key = random_key();
        let mut buffer = [0u8; MAX_PACKET_BYTES];
        let written = codec
            .encode(&Packet::Disconnect, &mut buffer, PROTOCOL_ID, 9, &key)
            .unwrap();

        // Disconnect -> Payload keeps the prefix valid but breaks the AAD
        buffer[0] = (buffer[0] & 0xf0) | PacketType::Payload as u8;
        let result = codec.decode(&buffer[..written], PROTOCOL_ID, &key);
        assert!(matches!(result, Err(DecodeError::Authentication)));
    }

    #[test]
    fn test_decode_rejects_malformed_prefix() {
        let codec = ChaChaPacketCodec::new();
        let key = random_key();

        assert!(matches!(
            codec.decode(&[], PROTOCOL_ID, &key),
            Err(DecodeError::TooShort { len: 0 })
        ));
        assert!(matches!(
            codec.decode(&[0x01; 32], PROTOCOL_ID, &key),
            Err(DecodeError::UnknownPacketType(1))
        ));
        assert!(matches!(
            codec.decode(&[0x05; 32], PROTOCOL_ID, &key),
            Err(DecodeError::InvalidPrefix(0x05))
        ));
        assert!(matches!(
            codec.decode(&[0x95; 32], PROTOCOL_ID, &key),
            Err(DecodeError::InvalidPrefix(0x95))
        ));
        assert!(matches!(
            codec.decode(&[0x15, 0x00, 0x00], PROTOCOL_ID, &key),
            Err(DecodeError::TooShort { len: 3 })
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_datagram() {
        let codec = ChaChaPacketCodec::new();
        let data = vec![0x15u8; MAX_PACKET_BYTES + 1];

        let result = codec.decode(&data, PROTOCOL_ID, &random_key());
        assert!(matches!(result, Err(DecodeError::Oversized { .. })));
    }

    #[test]
    fn test_decode_largest_sequence() {
        let codec = ChaChaPacketCodec::new();
        let key = random_key();
        let mut buffer = [0u8; MAX_PACKET_BYTES];
        let written = codec
            .encode(&Packet::Disconnect, &mut buffer, PROTOCOL_ID, u64::MAX, &key)
            .unwrap();

        assert_eq!(buffer[0] >> 4, 8);
        let (sequence, packet) = codec.decode(&buffer[..written], PROTOCOL_ID, &key).unwrap();
        assert_eq!(sequence, u64::MAX);
        assert_eq!(packet, Packet::Disconnect);
    }
}
