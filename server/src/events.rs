//! Diagnostic events emitted by client sessions
//!
//! Sessions never write to an output stream themselves. Everything worth
//! observing is handed to a [`SessionObserver`]; the server installs
//! [`LogObserver`] which forwards to the `log` facade.

use log::{debug, warn};
use std::io;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The slot was returned to the free state
    Cleared {
        client_index: Option<usize>,
        address: Option<SocketAddr>,
        last_send_time: f64,
        last_recv_time: f64,
    },
    /// A packet was encoded for a slot with no bound address and not written
    SendWithoutAddress {
        client_index: Option<usize>,
        sequence: u64,
    },
    /// The transport refused an encoded packet; the sequence is still consumed
    TransportFailed {
        client_index: Option<usize>,
        address: SocketAddr,
        sequence: u64,
        kind: io::ErrorKind,
    },
    /// A queued packet could not be encoded and was discarded during a flush
    QueuedPacketDropped {
        client_index: Option<usize>,
        reason: String,
    },
}

pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Cleared {
                client_index,
                address,
                last_send_time,
                last_recv_time,
            } => {
                debug!(
                    "Clearing client slot {:?} (address {:?}, last send {:.3}, last recv {:.3})",
                    client_index, address, last_send_time, last_recv_time
                );
            }
            SessionEvent::SendWithoutAddress {
                client_index,
                sequence,
            } => {
                debug!(
                    "Packet {} for client slot {:?} has no address, not sent",
                    sequence, client_index
                );
            }
            SessionEvent::TransportFailed {
                client_index,
                address,
                sequence,
                kind,
            } => {
                warn!(
                    "Failed to send packet {} to client slot {:?} at {}: {:?}",
                    sequence, client_index, address, kind
                );
            }
            SessionEvent::QueuedPacketDropped {
                client_index,
                reason,
            } => {
                warn!(
                    "Dropped queued packet for client slot {:?}: {}",
                    client_index, reason
                );
            }
        }
    }
}
