//! # Secure Session Server Library
//!
//! This library provides the server side of an encrypted, sequenced datagram
//! protocol for authoritative game servers. Every connected client occupies a
//! pre-allocated session slot that encrypts and sequences outbound packets,
//! authenticates inbound ones and rejects anything replayed or stale.
//!
//! ## Core Responsibilities
//!
//! ### Sequenced Encryption
//! Each outbound packet is sealed under a fresh sequence number. A sequence
//! value is consumed as soon as its ciphertext exists, even if the datagram is
//! never written, so the same nonce is never reused under one key.
//!
//! ### Replay Protection
//! Inbound packets are only handed upward after their sequence number passes a
//! fixed-size sliding window filter. Duplicates and packets older than the
//! window are dropped in constant time.
//!
//! ### Bounded Buffering
//! Packets can be queued per client for the next tick. Queues have a fixed
//! capacity and refuse new packets when full so producers see backpressure
//! instead of memory growth.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! The per-client slot: identity, addressing, timers, send and receive paths,
//! and the reset that returns a slot to the free state.
//!
//! ### Replay Module (`replay`) and Packet Queue Module (`packet_queue`)
//! The leaf components owned by every session.
//!
//! ### Client Manager Module (`client_manager`)
//! The fixed pool of sessions together with the key table (`encryption`):
//! activation, lookup, keep-alives, queue flushing and timeout sweeps.
//!
//! ### Network Module (`network`)
//! UDP socket ownership, the receive task and the tick loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new("127.0.0.1:40000", ServerConfig::default()).await?;
//!
//!     // The handshake layer activates slots through this handle
//!     let _clients = server.clients();
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod encryption;
pub mod events;
pub mod network;
pub mod packet_queue;
pub mod replay;
pub mod session;
pub mod transport;
