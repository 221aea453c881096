//! Outbound message queue
//!
//! One queue per producing node. Every envelope is kept until each consumer
//! type it targets has popped it; each consumer type reads through its own
//! cursor, so the queue only ever holds the slowest consumer's backlog.
//!
//! Invariant, per consumer type: `appended - sent - lost == pending_count`.

use bytes::Bytes;
use indexmap::IndexMap;
use std::collections::VecDeque;

use crate::flow::FlowPattern;

/// A queued message unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flow: FlowPattern,
    pub header: Bytes,
    pub payload: Bytes,
}

impl Envelope {
    #[must_use]
    pub fn new(flow: FlowPattern, header: Bytes, payload: Bytes) -> Self {
        Self {
            flow,
            header,
            payload,
        }
    }

    /// Size counted against the queue budget
    #[must_use]
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Per consumer type delivery state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerCursor {
    /// Number of leading queue entries this consumer has passed
    pub index: usize,
    pub appended: u64,
    pub sent: u64,
    pub lost: u64,
}

impl ConsumerCursor {
    #[must_use]
    pub const fn pending(&self) -> u64 {
        self.appended.saturating_sub(self.sent + self.lost)
    }
}

pub struct MessageQueue {
    node_name: String,
    entries: VecDeque<Envelope>,
    cursors: IndexMap<String, ConsumerCursor>,
    size_sum: usize,
}

impl MessageQueue {
    #[must_use]
    pub fn new(consumer_types: &[String], node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            entries: VecDeque::new(),
            cursors: consumer_types
                .iter()
                .map(|t| (t.clone(), ConsumerCursor::default()))
                .collect(),
            size_sum: 0,
        }
    }

    /// Queue an envelope for every configured consumer type it targets.
    ///
    /// Returns `false` when no consumer type is a next hop; the envelope is
    /// discarded in that case.
    pub fn append(&mut self, envelope: Envelope) -> bool {
        let mut has_recipient = false;
        for (consumer_type, cursor) in &mut self.cursors {
            if envelope.flow.is_next_hop(consumer_type, &self.node_name) {
                cursor.appended += 1;
                has_recipient = true;
            }
        }
        if has_recipient {
            self.size_sum += envelope.size();
            self.entries.push_back(envelope);
        }
        has_recipient
    }

    fn next_index(&self, consumer_type: &str) -> Option<usize> {
        let cursor = self.cursors.get(consumer_type)?;
        (cursor.index..self.entries.len())
            .find(|&i| self.entries[i].flow.is_next_hop(consumer_type, &self.node_name))
    }

    /// Whether an undelivered envelope exists for `consumer_type`
    #[must_use]
    pub fn has_pending(&self, consumer_type: &str) -> bool {
        self.next_index(consumer_type).is_some()
    }

    /// Take the earliest undelivered envelope addressed to `consumer_type`
    pub fn pop_for(&mut self, consumer_type: &str) -> Option<Envelope> {
        let index = self.next_index(consumer_type)?;
        let envelope = self.entries[index].clone();
        if let Some(cursor) = self.cursors.get_mut(consumer_type) {
            cursor.index = index + 1;
            cursor.sent += 1;
        }
        while self.compact_head() {}
        Some(envelope)
    }

    /// Drop the head envelope once every consumer type it targets has passed it
    fn compact_head(&mut self) -> bool {
        let Some(head) = self.entries.front() else {
            return false;
        };
        let still_needed = self.cursors.iter().any(|(consumer_type, cursor)| {
            cursor.index == 0 && head.flow.is_next_hop(consumer_type, &self.node_name)
        });
        if still_needed {
            return false;
        }
        if let Some(head) = self.entries.pop_front() {
            self.size_sum -= head.size();
        }
        for cursor in self.cursors.values_mut() {
            cursor.index = cursor.index.saturating_sub(1);
        }
        true
    }

    /// Remove the head envelope unconditionally, counting it as lost for every
    /// consumer type that had not received it yet.
    ///
    /// Returns `false` when the queue is empty.
    pub fn evict_oldest(&mut self) -> bool {
        let Some(head) = self.entries.pop_front() else {
            return false;
        };
        self.size_sum -= head.size();
        for (consumer_type, cursor) in &mut self.cursors {
            if cursor.index > 0 {
                cursor.index -= 1;
            } else if head.flow.is_next_hop(consumer_type, &self.node_name) {
                cursor.lost += 1;
            }
        }
        while self.compact_head() {}
        true
    }

    /// Messages queued for `consumer_type` and not yet delivered or lost
    #[must_use]
    pub fn pending_count(&self, consumer_type: &str) -> u64 {
        self.cursors.get(consumer_type).map_or(0, ConsumerCursor::pending)
    }

    /// True once no consumer type has anything left to receive
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.cursors.values().all(|c| c.pending() == 0)
    }

    #[must_use]
    pub fn cursor(&self, consumer_type: &str) -> Option<ConsumerCursor> {
        self.cursors.get(consumer_type).copied()
    }

    #[must_use]
    pub fn sent(&self, consumer_type: &str) -> u64 {
        self.cursors.get(consumer_type).map_or(0, |c| c.sent)
    }

    #[must_use]
    pub fn lost(&self, consumer_type: &str) -> u64 {
        self.cursors.get(consumer_type).map_or(0, |c| c.lost)
    }

    pub fn consumer_types(&self) -> impl Iterator<Item = &str> {
        self.cursors.keys().map(String::as_str)
    }

    #[must_use]
    pub fn is_consumer_type(&self, consumer_type: &str) -> bool {
        self.cursors.contains_key(consumer_type)
    }

    /// Sum of queued payload sizes
    #[must_use]
    pub const fn size_sum(&self) -> usize {
        self.size_sum
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
