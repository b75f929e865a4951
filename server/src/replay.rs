//! Sliding-window replay protection for inbound sequence numbers
//!
//! The filter keeps a fixed table of `window` entries indexed by
//! `sequence % window`. Each entry stores the actual sequence last recorded at
//! that slot, which disambiguates values that map to the same slot across
//! wraps. Checks and inserts are O(1) and memory never grows.

use shared::REPLAY_PROTECTION_BUFFER_SIZE;

/// Marks a table slot that has never recorded a sequence
const EMPTY: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct ReplayFilter {
    most_recent_sequence: u64,
    received: Box<[u64]>,
}

impl Default for ReplayFilter {
    fn default() -> Self {
        Self::new(REPLAY_PROTECTION_BUFFER_SIZE)
    }
}

impl ReplayFilter {
    /// Creates an empty filter tracking `window` sequence numbers
    ///
    /// A zero window is bumped to one so the modulo below is always defined.
    pub fn new(window: usize) -> Self {
        Self {
            most_recent_sequence: 0,
            received: vec![EMPTY; window.max(1)].into_boxed_slice(),
        }
    }

    pub fn window(&self) -> usize {
        self.received.len()
    }

    pub fn most_recent_sequence(&self) -> u64 {
        self.most_recent_sequence
    }

    /// Returns true and records `sequence` if it has not been seen before
    ///
    /// Sequences older than the window relative to the most recent accepted
    /// value are rejected outright, as are values whose slot already holds the
    /// same or a newer sequence.
    pub fn check_and_insert(&mut self, sequence: u64) -> bool {
        let window = self.received.len() as u64;

        if sequence.saturating_add(window) <= self.most_recent_sequence {
            return false;
        }

        let index = (sequence % window) as usize;
        let recorded = self.received[index];
        if recorded != EMPTY && recorded >= sequence {
            return false;
        }

        self.received[index] = sequence;
        if sequence > self.most_recent_sequence {
            self.most_recent_sequence = sequence;
        }

        true
    }

    /// Forgets all history; sequence 0 becomes acceptable again
    pub fn reset(&mut self) {
        self.most_recent_sequence = 0;
        self.received.fill(EMPTY);
    }
}
