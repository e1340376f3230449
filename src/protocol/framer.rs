//! Message fragmentation and reassembly.
//!
//! [`Fragmenter`] slices outbound messages into wire-sized fragments.
//! [`Reassembler`] collects inbound fragments keyed by message id, in any
//! order and with any amount of duplication, and emits each message once all
//! of its fragments are present. Partial messages are dropped once their
//! deadline passes; they are never delivered.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use super::{fragment_count, DedupWindow, Fragment, MAX_MESSAGE_SIZE, MIN_PAYLOAD_SIZE};
use crate::error::{Error, Result};
use crate::types::{deadline_after, Message, MessageId};

/// Splits messages into fragments of at most `max_payload_size` bytes.
#[derive(Debug, Clone, Copy)]
pub struct Fragmenter {
    max_payload_size: usize,
}

impl Fragmenter {
    /// Create a fragmenter. The payload size is clamped so that a maximum
    /// size message never needs more than `u16::MAX` fragments.
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            max_payload_size: max_payload_size.clamp(MIN_PAYLOAD_SIZE, u16::MAX as usize),
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Split a message into fragments, in index order.
    pub fn fragment(&self, message: &Message) -> Result<Vec<Fragment>> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(Error::PayloadTooLarge {
                size: message.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let count = fragment_count(message.len(), self.max_payload_size);
        let count_u16 = count as u16;

        let fragments = (0..count)
            .map(|index| {
                let start = index * self.max_payload_size;
                let end = (start + self.max_payload_size).min(message.len());
                Fragment::data(
                    message.id,
                    index as u16,
                    count_u16,
                    message.payload.slice(start..end),
                )
            })
            .collect();

        Ok(fragments)
    }
}

/// Reassembly tuning.
#[derive(Debug, Clone, Copy)]
pub struct ReassemblerConfig {
    /// How long a partial message may wait for its remaining fragments.
    pub timeout: Duration,
    /// How long a seen fragment (or completed message) is remembered.
    pub dedup_horizon: Duration,
    /// Upper bound on remembered fragments.
    pub dedup_capacity: usize,
    /// Upper bound on concurrently open partial messages.
    pub max_buffers: usize,
    /// Minimum spacing between acknowledgments of the same completed message.
    pub reack_interval: Duration,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            dedup_horizon: Duration::from_secs(5),
            dedup_capacity: 65_536,
            max_buffers: 1024,
            reack_interval: Duration::from_millis(50),
        }
    }
}

/// Result of feeding one fragment to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// The fragment completed its message.
    Complete(Message),
    /// Stored; more fragments are needed.
    Pending,
    /// Already seen. `reack` asks the caller to acknowledge the (already
    /// delivered) message again because the sender is evidently retrying.
    Duplicate { reack: bool },
    /// Failed verification or contradicts the buffered state.
    Rejected,
}

impl Accepted {
    /// The completed message, if any.
    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Complete(message) => Some(message),
            _ => None,
        }
    }
}

/// Reassembly counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub completed: u64,
    pub duplicates: u64,
    pub checksum_failures: u64,
    pub rejected: u64,
    pub expired: u64,
    pub evicted: u64,
}

/// Per-message holding area.
#[derive(Debug)]
struct ReassemblyBuffer {
    count: u16,
    slots: Vec<Option<Bytes>>,
    received: u16,
    bytes: usize,
    deadline: Instant,
}

impl ReassemblyBuffer {
    fn new(count: u16, deadline: Instant) -> Self {
        Self {
            count,
            slots: vec![None; count as usize],
            received: 0,
            bytes: 0,
            deadline,
        }
    }

    /// Store a payload. Returns false if the index was already filled.
    fn insert(&mut self, index: u16, payload: Bytes) -> bool {
        let slot = &mut self.slots[index as usize];
        if slot.is_some() {
            return false;
        }
        self.bytes += payload.len();
        *slot = Some(payload);
        self.received += 1;
        true
    }

    fn is_complete(&self) -> bool {
        self.received == self.count
    }

    fn assemble(self) -> Bytes {
        if self.slots.len() == 1 {
            return self.slots.into_iter().flatten().next().unwrap_or_default();
        }
        let mut buf = BytesMut::with_capacity(self.bytes);
        for payload in self.slots.into_iter().flatten() {
            buf.extend_from_slice(&payload);
        }
        buf.freeze()
    }
}

/// Receive-side fragment collector.
#[derive(Debug)]
pub struct Reassembler {
    config: ReassemblerConfig,
    buffers: HashMap<MessageId, ReassemblyBuffer>,
    /// Recently seen (message, fragment index) pairs.
    seen: DedupWindow<(MessageId, u16)>,
    /// Recently completed messages.
    completed: DedupWindow<MessageId>,
    /// Last acknowledgment instant per completed message.
    last_ack: HashMap<MessageId, Instant>,
    stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            seen: DedupWindow::new(config.dedup_horizon, config.dedup_capacity),
            completed: DedupWindow::new(config.dedup_horizon, config.dedup_capacity),
            config,
            buffers: HashMap::new(),
            last_ack: HashMap::new(),
            stats: ReassemblyStats::default(),
        }
    }

    /// Feed one data fragment. Acknowledgments are rejected.
    pub fn accept(&mut self, fragment: Fragment, now: Instant) -> Accepted {
        if !fragment.verify() {
            self.stats.checksum_failures += 1;
            tracing::debug!(
                message_id = %fragment.message_id,
                index = fragment.index,
                "Dropping fragment with bad checksum"
            );
            return Accepted::Rejected;
        }

        if fragment.count == 0 || fragment.index >= fragment.count {
            self.stats.rejected += 1;
            return Accepted::Rejected;
        }

        let id = fragment.message_id;

        if self.completed.contains(&id, now) {
            self.stats.duplicates += 1;
            return Accepted::Duplicate {
                reack: self.take_ack_slot(id, now),
            };
        }

        if let Some(buffer) = self.buffers.get(&id) {
            if buffer.count != fragment.count
                || buffer.bytes + fragment.payload.len() > MAX_MESSAGE_SIZE
            {
                self.stats.rejected += 1;
                tracing::debug!(
                    message_id = %id,
                    declared = buffer.count,
                    got = fragment.count,
                    "Dropping fragment inconsistent with its message"
                );
                return Accepted::Rejected;
            }
        }

        if self.seen.check_and_insert((id, fragment.index), now) {
            self.stats.duplicates += 1;
            return Accepted::Duplicate { reack: false };
        }

        if !self.buffers.contains_key(&id) && self.buffers.len() >= self.config.max_buffers {
            self.evict_oldest();
        }

        let deadline = deadline_after(now, self.config.timeout);
        let buffer = match self.buffers.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(ReassemblyBuffer::new(fragment.count, deadline)),
        };

        if !buffer.insert(fragment.index, fragment.payload) {
            self.stats.duplicates += 1;
            return Accepted::Duplicate { reack: false };
        }

        if !buffer.is_complete() {
            return Accepted::Pending;
        }

        let Some(buffer) = self.buffers.remove(&id) else {
            return Accepted::Pending;
        };
        self.completed.check_and_insert(id, now);
        self.last_ack.insert(id, now);
        self.stats.completed += 1;

        Accepted::Complete(Message::new(id, buffer.assemble()))
    }

    /// Drop partial messages whose deadline has passed. Returns how many.
    ///
    /// The fragments they held are forgotten by the dedup window, so a
    /// retransmission can rebuild the message from scratch.
    pub fn expire(&mut self, now: Instant) -> usize {
        let due: Vec<MessageId> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| buffer.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &due {
            if let Some(buffer) = self.buffers.remove(id) {
                tracing::debug!(
                    message_id = %id,
                    received = buffer.received,
                    count = buffer.count,
                    "Reassembly timed out"
                );
                self.forget_fragments(*id, &buffer);
            }
        }
        self.stats.expired += due.len() as u64;

        self.seen.expire(now);
        self.completed.expire(now);
        let completed = &self.completed;
        self.last_ack.retain(|id, _| completed.contains(id, now));

        due.len()
    }

    /// Earliest partial-message deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffers.values().map(|b| b.deadline).min()
    }

    /// Number of partial messages currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buffers.len()
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Record a fragment that never made it to `accept` because it failed
    /// wire verification.
    pub fn record_checksum_failure(&mut self) {
        self.stats.checksum_failures += 1;
    }

    fn take_ack_slot(&mut self, id: MessageId, now: Instant) -> bool {
        let due = self
            .last_ack
            .get(&id)
            .map_or(true, |last| now.duration_since(*last) >= self.config.reack_interval);
        if due {
            self.last_ack.insert(id, now);
        }
        due
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .buffers
            .iter()
            .min_by_key(|(_, buffer)| buffer.deadline)
            .map(|(id, _)| *id);

        if let Some((id, buffer)) = oldest.and_then(|id| self.buffers.remove_entry(&id)) {
            self.forget_fragments(id, &buffer);
            self.stats.evicted += 1;
            tracing::debug!(message_id = %id, "Evicted partial message, buffer table full");
        }
    }

    fn forget_fragments(&mut self, id: MessageId, buffer: &ReassemblyBuffer) {
        for (index, slot) in buffer.slots.iter().enumerate() {
            if slot.is_some() {
                self.seen.remove(&(id, index as u16));
            }
        }
    }
}
