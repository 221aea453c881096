//! Producer statistics
//!
//! Per consumer type the producer keeps small rolling buffers of processing
//! durations and round-trip times. Every reporting tick drains them into one
//! [`StatisticsEvent`] per consumer type and hands the batch to a
//! [`StatisticsSink`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Entries kept per rolling buffer
pub const RING_CAPACITY: usize = 10;

/// Fixed-size buffer, the oldest value is overwritten once full
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Take every value, oldest first, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new(RING_CAPACITY)
    }
}

/// Completion report a listener attaches to its "done" signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneReport {
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Snapshot for one consumer type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsEvent {
    pub node_name: String,
    pub consumer_type: String,
    /// Messages handed to listeners of this type so far
    pub sent: u64,
    /// Messages still queued for this type
    pub queue_size: u64,
    pub durations: Vec<u64>,
    pub round_trips: Vec<u64>,
    /// Completion reports received so far
    pub responses: u64,
    /// Messages evicted before this type received them
    pub dropped: u64,
    pub timestamp: DateTime<Utc>,
}

/// Receiver of periodic statistics batches
#[cfg_attr(test, mockall::automock)]
pub trait StatisticsSink: Send + Sync {
    fn publish(&self, events: Vec<StatisticsEvent>);
}

impl StatisticsSink for mpsc::UnboundedSender<Vec<StatisticsEvent>> {
    fn publish(&self, events: Vec<StatisticsEvent>) {
        // Receiver gone means nobody is interested anymore
        let _ = self.send(events);
    }
}

impl<F> StatisticsSink for F
where
    F: Fn(Vec<StatisticsEvent>) + Send + Sync,
{
    fn publish(&self, events: Vec<StatisticsEvent>) {
        self(events);
    }
}

/// Rolling accumulators for one consumer type
#[derive(Debug, Default)]
pub(crate) struct ConsumerStats {
    pub durations: RingBuffer<u64>,
    pub round_trips: RingBuffer<u64>,
    pub responses: u64,
}

impl ConsumerStats {
    pub fn record(&mut self, duration_ms: Option<u64>, round_trip_ms: u64) {
        if let Some(duration) = duration_ms {
            self.durations.push(duration);
        }
        self.round_trips.push(round_trip_ms);
        self.responses += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_overwrites_oldest() {
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.drain(), vec![2, 3, 4]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_default_capacity() {
        let mut ring = RingBuffer::default();
        for i in 0..25u64 {
            ring.push(i);
        }
        assert_eq!(ring.len(), RING_CAPACITY);
        assert_eq!(ring.iter().next(), Some(&15));
    }

    #[test]
    fn test_consumer_stats_record() {
        let mut stats = ConsumerStats::default();
        stats.record(Some(12), 15);
        stats.record(None, 3);
        assert_eq!(stats.responses, 2);
        assert_eq!(stats.durations.drain(), vec![12]);
        assert_eq!(stats.round_trips.drain(), vec![15, 3]);
    }

    #[test]
    fn test_channel_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let event = StatisticsEvent {
            node_name: "a".to_string(),
            consumer_type: "b".to_string(),
            sent: 1,
            queue_size: 0,
            durations: vec![],
            round_trips: vec![],
            responses: 0,
            dropped: 0,
            timestamp: Utc::now(),
        };
        tx.publish(vec![event.clone()]);
        assert_eq!(rx.try_recv().unwrap(), vec![event]);
    }
}
