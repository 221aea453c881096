//! Ready-worker registry
//!
//! Tracks, per consumer type, the downstream listeners that advertised
//! readiness and have not expired. A listener is handed at most one message
//! per advertisement: `take_one` consumes the registration.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerEntry {
    pub expiry: Instant,
}

pub struct WorkerRegistry {
    /// consumer type -> address -> entry, in readiness order
    workers: HashMap<String, IndexMap<String, WorkerEntry>>,
    liveness: Duration,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new(consumer_types: &[String], liveness: Duration) -> Self {
        Self {
            workers: consumer_types
                .iter()
                .map(|t| (t.clone(), IndexMap::new()))
                .collect(),
            liveness,
        }
    }

    /// Register (or refresh) a ready worker at the back of the line
    pub fn mark_ready(&mut self, consumer_type: &str, address: &str, now: Instant) {
        let Some(queue) = self.workers.get_mut(consumer_type) else {
            return;
        };
        queue.shift_remove(address);
        queue.insert(
            address.to_string(),
            WorkerEntry {
                expiry: now + self.liveness,
            },
        );
    }

    /// Extend the expiry of an already registered worker without reordering it
    pub fn refresh(&mut self, consumer_type: &str, address: &str, now: Instant) -> bool {
        match self
            .workers
            .get_mut(consumer_type)
            .and_then(|queue| queue.get_mut(address))
        {
            Some(entry) => {
                entry.expiry = now + self.liveness;
                true
            }
            None => false,
        }
    }

    pub fn mark_not_ready(&mut self, consumer_type: &str, address: &str) -> bool {
        self.workers
            .get_mut(consumer_type)
            .and_then(|queue| queue.shift_remove(address))
            .is_some()
    }

    /// Remove `address` from every consumer type (peer disconnected)
    pub fn remove_address(&mut self, address: &str) {
        for queue in self.workers.values_mut() {
            queue.shift_remove(address);
        }
    }

    /// Drop every worker whose expiry has passed
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        for (consumer_type, queue) in &mut self.workers {
            queue.retain(|address, entry| {
                let alive = now <= entry.expiry;
                if !alive {
                    warn!(
                        consumer_type = %consumer_type,
                        address = %address,
                        "Idle worker expired"
                    );
                    purged += 1;
                }
                alive
            });
        }
        purged
    }

    /// Remove and return the longest-waiting ready worker of `consumer_type`
    pub fn take_one(&mut self, consumer_type: &str) -> Option<String> {
        let queue = self.workers.get_mut(consumer_type)?;
        let (address, _) = queue.shift_remove_index(0)?;
        debug!(consumer_type = %consumer_type, address = %address, "Worker taken for dispatch");
        Some(address)
    }

    #[must_use]
    pub fn is_ready(&self, consumer_type: &str, address: &str) -> bool {
        self.workers
            .get(consumer_type)
            .is_some_and(|queue| queue.contains_key(address))
    }

    #[must_use]
    pub fn ready_count(&self, consumer_type: &str) -> usize {
        self.workers.get(consumer_type).map_or(0, IndexMap::len)
    }

    /// Every registered `(consumer_type, address)` pair
    pub fn ready_workers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.workers.iter().flat_map(|(consumer_type, queue)| {
            queue
                .keys()
                .map(move |address| (consumer_type.as_str(), address.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(&["b".to_string(), "c".to_string()], Duration::from_secs(5))
    }

    #[test]
    fn test_take_one_in_readiness_order() {
        let mut registry = registry();
        let now = Instant::now();
        registry.mark_ready("b", "w1", now);
        registry.mark_ready("b", "w2", now);
        registry.mark_ready("b", "w1", now); // re-advertise moves w1 to the back

        assert_eq!(registry.take_one("b").as_deref(), Some("w2"));
        assert_eq!(registry.take_one("b").as_deref(), Some("w1"));
        assert_eq!(registry.take_one("b"), None);
    }

    #[test]
    fn test_unknown_consumer_type_is_ignored() {
        let mut registry = registry();
        registry.mark_ready("x", "w1", Instant::now());
        assert_eq!(registry.ready_count("x"), 0);
        assert_eq!(registry.take_one("x"), None);
    }

    #[test]
    fn test_mark_not_ready() {
        let mut registry = registry();
        registry.mark_ready("c", "w1", Instant::now());
        assert!(registry.is_ready("c", "w1"));
        assert!(registry.mark_not_ready("c", "w1"));
        assert!(!registry.mark_not_ready("c", "w1"));
        assert_eq!(registry.take_one("c"), None);
    }

    #[test]
    fn test_purge_expired() {
        let mut registry = registry();
        let start = Instant::now();
        registry.mark_ready("b", "old", start);
        registry.mark_ready("c", "fresh", start + Duration::from_secs(4));

        assert_eq!(registry.purge_expired(start + Duration::from_secs(5)), 0);
        assert_eq!(registry.purge_expired(start + Duration::from_secs(6)), 1);
        assert!(!registry.is_ready("b", "old"));
        assert!(registry.is_ready("c", "fresh"));
    }

    #[test]
    fn test_refresh_keeps_order() {
        let mut registry = registry();
        let start = Instant::now();
        registry.mark_ready("b", "w1", start);
        registry.mark_ready("b", "w2", start);
        assert!(registry.refresh("b", "w1", start + Duration::from_secs(4)));
        assert!(!registry.refresh("b", "w3", start));

        assert_eq!(registry.purge_expired(start + Duration::from_secs(6)), 1);
        assert_eq!(registry.take_one("b").as_deref(), Some("w1"));
    }

    #[test]
    fn test_remove_address_everywhere() {
        let mut registry = registry();
        let now = Instant::now();
        registry.mark_ready("b", "w1", now);
        registry.mark_ready("c", "w1", now);
        registry.remove_address("w1");
        assert_eq!(registry.ready_workers().count(), 0);
    }
}
