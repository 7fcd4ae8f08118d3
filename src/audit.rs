//! # Message Audit
//!
//! Bounded sliding-window duplicate detector keyed by the per-producer
//! monotonic sequence id. Each tracked producer gets a fixed 2048-slot
//! bitmap indexed by `sequence mod window`, so memory per producer is stable
//! no matter how long it lives. The producer table itself is LRU-bounded.
//!
//! Used after a failover replay to drop the second delivery of a message
//! whose acknowledgement was lost with the old transport.

use crate::commands::{MessageId, ProducerId};
use parking_lot::Mutex;
use std::collections::HashMap;

const BITS_PER_WORD: usize = 64;

struct ProducerWindow {
    /// Highest sequence observed so far; -1 before the first.
    max_sequence: i64,
    bits: Vec<u64>,
    window: usize,
}

impl ProducerWindow {
    fn new(window: usize) -> Self {
        Self {
            max_sequence: -1,
            bits: vec![0; window / BITS_PER_WORD + 1],
            window,
        }
    }

    fn slot(&self, sequence: i64) -> (usize, u64) {
        let index = (sequence.rem_euclid(self.window as i64)) as usize;
        (index / BITS_PER_WORD, 1u64 << (index % BITS_PER_WORD))
    }

    fn test(&self, sequence: i64) -> bool {
        let (word, mask) = self.slot(sequence);
        self.bits[word] & mask != 0
    }

    fn set(&mut self, sequence: i64, value: bool) {
        let (word, mask) = self.slot(sequence);
        if value {
            self.bits[word] |= mask;
        } else {
            self.bits[word] &= !mask;
        }
    }

    /// Advances the window head, clearing every slot the advance rolls over.
    fn advance_to(&mut self, sequence: i64) {
        if sequence - self.max_sequence >= self.window as i64 {
            self.bits.iter_mut().for_each(|w| *w = 0);
        } else {
            let mut cursor = self.max_sequence + 1;
            while cursor <= sequence {
                self.set(cursor, false);
                cursor += 1;
            }
        }
        self.max_sequence = sequence;
    }

    /// Marks a sequence seen; returns true when it was already seen (or has
    /// fallen behind the window, which is treated as a duplicate).
    fn mark(&mut self, sequence: i64) -> bool {
        if sequence > self.max_sequence {
            self.advance_to(sequence);
            self.set(sequence, true);
            return false;
        }
        if sequence <= self.max_sequence - self.window as i64 {
            return true;
        }
        if self.test(sequence) {
            return true;
        }
        self.set(sequence, true);
        false
    }
}

/// Sliding-window duplicate detector over producer sequence ids.
pub struct MessageAudit {
    producers: Mutex<AuditState>,
    window: usize,
    max_producers: usize,
}

struct AuditState {
    windows: HashMap<ProducerId, ProducerWindow>,
    /// Insertion order for LRU eviction of idle producers.
    order: Vec<ProducerId>,
}

impl MessageAudit {
    pub fn new() -> Self {
        Self::with_window(crate::defaults::AUDIT_WINDOW, crate::defaults::AUDIT_MAX_PRODUCERS)
    }

    pub fn with_window(window: usize, max_producers: usize) -> Self {
        Self {
            producers: Mutex::new(AuditState { windows: HashMap::new(), order: Vec::new() }),
            window,
            max_producers,
        }
    }

    /// Marks the id seen and reports whether it had been seen before.
    pub fn is_duplicate(&self, message_id: &MessageId) -> bool {
        let mut state = self.producers.lock();
        self.touch(&mut state, &message_id.producer_id);
        let window = self.window;
        state
            .windows
            .entry(message_id.producer_id.clone())
            .or_insert_with(|| ProducerWindow::new(window))
            .mark(message_id.producer_sequence_id)
    }

    /// True iff the sequence is exactly the next expected one for its
    /// producer (or the first ever observed). Does not mark anything seen.
    pub fn is_in_order(&self, message_id: &MessageId) -> bool {
        let state = self.producers.lock();
        match state.windows.get(&message_id.producer_id) {
            Some(window) => message_id.producer_sequence_id == window.max_sequence + 1,
            None => true,
        }
    }

    /// Un-sees an id, used when a pending transaction is rolled back so the
    /// redelivery after the rollback is not flagged.
    pub fn rollback(&self, message_id: &MessageId) {
        let mut state = self.producers.lock();
        if let Some(window) = state.windows.get_mut(&message_id.producer_id) {
            let sequence = message_id.producer_sequence_id;
            if sequence > window.max_sequence - window.window as i64 {
                window.set(sequence, false);
            }
        }
    }

    fn touch(&self, state: &mut AuditState, producer: &ProducerId) {
        if let Some(position) = state.order.iter().position(|p| p == producer) {
            state.order.remove(position);
        }
        state.order.push(producer.clone());
        while state.order.len() > self.max_producers {
            let evicted = state.order.remove(0);
            state.windows.remove(&evicted);
        }
    }
}

impl Default for MessageAudit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{ConnectionId, SessionId};

    fn message_id(producer: i64, sequence: i64) -> MessageId {
        let connection = ConnectionId::new("ID:audit-1");
        let session = SessionId::new(&connection, 1);
        MessageId {
            producer_id: ProducerId::new(&session, producer),
            producer_sequence_id: sequence,
        }
    }

    #[test]
    fn first_sighting_is_not_a_duplicate() {
        let audit = MessageAudit::new();
        assert!(!audit.is_duplicate(&message_id(1, 42)));
        assert!(audit.is_duplicate(&message_id(1, 42)));
    }

    #[test]
    fn in_order_tracks_the_next_expected_sequence() {
        let audit = MessageAudit::new();
        assert!(audit.is_in_order(&message_id(1, 0)));
        audit.is_duplicate(&message_id(1, 0));
        assert!(audit.is_in_order(&message_id(1, 1)));
        assert!(!audit.is_in_order(&message_id(1, 3)));
    }

    #[test]
    fn gaps_within_the_window_are_remembered() {
        let audit = MessageAudit::new();
        audit.is_duplicate(&message_id(1, 10));
        // 5 was skipped; still within the window, so not a duplicate yet.
        assert!(!audit.is_duplicate(&message_id(1, 5)));
        assert!(audit.is_duplicate(&message_id(1, 5)));
    }

    #[test]
    fn sequences_behind_the_window_count_as_duplicates() {
        let audit = MessageAudit::with_window(64, 4);
        audit.is_duplicate(&message_id(1, 1000));
        assert!(audit.is_duplicate(&message_id(1, 1000 - 64)));
    }

    #[test]
    fn rollback_unsees_a_sequence() {
        let audit = MessageAudit::new();
        audit.is_duplicate(&message_id(1, 7));
        audit.rollback(&message_id(1, 7));
        assert!(!audit.is_duplicate(&message_id(1, 7)));
    }

    #[test]
    fn producers_are_independent_and_lru_bounded() {
        let audit = MessageAudit::with_window(2048, 2);
        assert!(!audit.is_duplicate(&message_id(1, 5)));
        assert!(!audit.is_duplicate(&message_id(2, 5)));
        // Producer 3 evicts producer 1.
        assert!(!audit.is_duplicate(&message_id(3, 5)));
        // Producer 1's history is gone, so 5 looks fresh again.
        assert!(!audit.is_duplicate(&message_id(1, 5)));
    }

    #[test]
    fn window_advance_clears_rolled_over_slots() {
        let audit = MessageAudit::with_window(64, 4);
        audit.is_duplicate(&message_id(1, 3));
        // Jump far enough that slot 3 is rolled over (3 + 64).
        audit.is_duplicate(&message_id(1, 67));
        assert!(!audit.is_duplicate(&message_id(1, 67 - 1)), "66 unseen, in window");
    }
}
