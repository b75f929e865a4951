//! Per-connection key table
//!
//! Sessions refer to their keys through an encryption index into this table
//! rather than holding key material themselves. Entries are zeroized when
//! they are removed or overwritten.

use rand::RngCore;
use shared::PacketKey;
use std::fmt;
use std::net::SocketAddr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Keys for both directions of one client connection
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Encrypts packets from the server to the client
    pub send_key: PacketKey,
    /// Decrypts packets from the client to the server
    pub receive_key: PacketKey,
}

impl SessionKeys {
    pub fn new(send_key: PacketKey, receive_key: PacketKey) -> Self {
        Self {
            send_key,
            receive_key,
        }
    }

    /// Fresh random keys, as a handshake layer would hand out
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut send_key = [0u8; 32];
        let mut receive_key = [0u8; 32];
        rng.fill_bytes(&mut send_key);
        rng.fill_bytes(&mut receive_key);
        Self::new(send_key, receive_key)
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("send_key", &"[REDACTED]")
            .field("receive_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug)]
struct EncryptionEntry {
    address: SocketAddr,
    keys: SessionKeys,
    last_access_time: f64,
    /// Seconds of inactivity before the entry expires; negative never expires
    timeout: f64,
}

impl EncryptionEntry {
    fn is_expired(&self, time: f64) -> bool {
        self.timeout >= 0.0 && self.last_access_time + self.timeout < time
    }
}

#[derive(Debug)]
pub struct EncryptionManager {
    entries: Vec<Option<EncryptionEntry>>,
}

impl EncryptionManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Stores keys for `address`, replacing any existing entry for it
    ///
    /// Returns the encryption index, or None if every entry is in use and
    /// none has expired.
    pub fn add(
        &mut self,
        address: SocketAddr,
        keys: SessionKeys,
        time: f64,
        timeout: f64,
    ) -> Option<usize> {
        let index = self
            .entries
            .iter()
            .position(|entry| matches!(entry, Some(e) if e.address == address))
            .or_else(|| {
                self.entries.iter().position(|entry| match entry {
                    None => true,
                    Some(e) => e.is_expired(time),
                })
            })?;

        self.entries[index] = Some(EncryptionEntry {
            address,
            keys,
            last_access_time: time,
            timeout,
        });
        Some(index)
    }

    /// Index of the live entry for `address`
    pub fn find(&self, address: SocketAddr, time: f64) -> Option<usize> {
        self.entries.iter().position(|entry| {
            matches!(entry, Some(e) if e.address == address && !e.is_expired(time))
        })
    }

    pub fn keys(&self, index: usize) -> Option<&SessionKeys> {
        self.entries
            .get(index)
            .and_then(|entry| entry.as_ref())
            .map(|entry| &entry.keys)
    }

    pub fn touch(&mut self, index: usize, time: f64) {
        if let Some(Some(entry)) = self.entries.get_mut(index) {
            entry.last_access_time = time;
        }
    }

    pub fn remove(&mut self, index: usize) -> bool {
        match self.entries.get_mut(index) {
            Some(entry) => entry.take().is_some(),
            None => false,
        }
    }

    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    #[test]
    fn test_generate_produces_distinct_keys() {
        let a = SessionKeys::generate();
        let b = SessionKeys::generate();
        assert_ne!(a.send_key, b.send_key);
        assert_ne!(a.send_key, a.receive_key);
    }

    #[test]
    fn test_debug_redacts_keys() {
        let keys = SessionKeys::new([0xab; 32], [0xcd; 32]);
        let output = format!("{:?}", keys);
        assert!(output.contains("REDACTED"));
        assert!(!output.contains("171"));
    }

    #[test]
    fn test_add_and_find() {
        let mut manager = EncryptionManager::new(4);
        let index = manager
            .add(test_addr(), SessionKeys::new([1; 32], [2; 32]), 0.0, 5.0)
            .unwrap();

        assert_eq!(manager.find(test_addr(), 1.0), Some(index));
        assert_eq!(manager.find(test_addr2(), 1.0), None);
        assert_eq!(manager.keys(index).unwrap().send_key, [1; 32]);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_add_same_address_replaces_entry() {
        let mut manager = EncryptionManager::new(4);
        let first = manager
            .add(test_addr(), SessionKeys::new([1; 32], [1; 32]), 0.0, 5.0)
            .unwrap();
        let second = manager
            .add(test_addr(), SessionKeys::new([2; 32], [2; 32]), 0.0, 5.0)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.keys(first).unwrap().receive_key, [2; 32]);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_full_table_reuses_expired_entry() {
        let mut manager = EncryptionManager::new(1);
        manager
            .add(test_addr(), SessionKeys::generate(), 0.0, 5.0)
            .unwrap();

        assert!(manager
            .add(test_addr2(), SessionKeys::generate(), 1.0, 5.0)
            .is_none());
        assert_eq!(
            manager.add(test_addr2(), SessionKeys::generate(), 10.0, 5.0),
            Some(0)
        );
    }

    #[test]
    fn test_touch_extends_lifetime() {
        let mut manager = EncryptionManager::new(2);
        let index = manager
            .add(test_addr(), SessionKeys::generate(), 0.0, 5.0)
            .unwrap();

        manager.touch(index, 4.0);
        assert_eq!(manager.find(test_addr(), 8.0), Some(index));
        assert_eq!(manager.find(test_addr(), 9.5), None);
    }

    #[test]
    fn test_negative_timeout_never_expires() {
        let mut manager = EncryptionManager::new(1);
        manager
            .add(test_addr(), SessionKeys::generate(), 0.0, -1.0)
            .unwrap();
        assert_eq!(manager.find(test_addr(), 1.0e9), Some(0));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut manager = EncryptionManager::new(2);
        let a = manager
            .add(test_addr(), SessionKeys::generate(), 0.0, 5.0)
            .unwrap();
        manager
            .add(test_addr2(), SessionKeys::generate(), 0.0, 5.0)
            .unwrap();

        assert!(manager.remove(a));
        assert!(!manager.remove(a));
        assert!(!manager.remove(99));
        assert!(manager.keys(a).is_none());

        manager.clear();
        assert!(manager.is_empty());
        assert_eq!(manager.capacity(), 2);
    }
}
