//! Bounded cache of task results served to peers.
//!
//! Reads do not refresh an entry; once the cache is full, the entry that was
//! updated longest ago is evicted.

use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use tracing::debug;

use pipestream_core::path::Lookup;
use pipestream_core::Path;

pub struct DataCache {
    entries: LruCache<String, Value>,
}

impl DataCache {
    /// A zero size is treated as one
    #[must_use]
    pub fn new(max_cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Store the result of `task_id`, evicting the oldest update when full
    pub fn update(&mut self, task_id: impl Into<String>, value: Value) {
        let task_id = task_id.into();
        if let Some((evicted, _)) = self.entries.push(task_id.clone(), value) {
            if evicted != task_id {
                debug!(task_id = %evicted, "Evicted cached task result");
            }
        }
    }

    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<&Value> {
        self.entries.peek(task_id)
    }

    /// Look up `path` inside the result of `task_id`
    #[must_use]
    pub fn lookup(&self, task_id: &str, path: &Path) -> Option<Lookup<'_>> {
        self.get(task_id).map(|value| path.lookup(value))
    }

    #[must_use]
    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.contains(task_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_evicts_oldest_update() {
        let mut cache = DataCache::new(2);
        cache.update("t1", json!(1));
        cache.update("t2", json!(2));
        // Reading t1 does not protect it
        assert_eq!(cache.get("t1"), Some(&json!(1)));
        cache.update("t3", json!(3));

        assert!(!cache.contains("t1"));
        assert!(cache.contains("t2"));
        assert!(cache.contains("t3"));
    }

    #[test]
    fn test_update_existing_refreshes() {
        let mut cache = DataCache::new(2);
        cache.update("t1", json!(1));
        cache.update("t2", json!(2));
        cache.update("t1", json!(10));
        cache.update("t3", json!(3));

        assert_eq!(cache.get("t1"), Some(&json!(10)));
        assert!(!cache.contains("t2"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lookup_path() {
        let mut cache = DataCache::new(1);
        cache.update("t1", json!({ "a": [null, { "b": 2 }] }));

        let found: Path = "a.1.b".parse().unwrap();
        let null: Path = "a.0".parse().unwrap();
        let missing: Path = "a.5".parse().unwrap();
        assert_eq!(cache.lookup("t1", &found), Some(Lookup::Found(&json!(2))));
        assert_eq!(cache.lookup("t1", &null), Some(Lookup::Found(&Value::Null)));
        assert_eq!(cache.lookup("t1", &missing), Some(Lookup::NotFound));
        assert_eq!(cache.lookup("t2", &found), None);
    }

    #[test]
    fn test_zero_size_holds_one() {
        let mut cache = DataCache::new(0);
        cache.update("t1", json!(1));
        cache.update("t2", json!(2));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("t2"));
    }
}
