//! In-memory storage backend.

use crate::error::Error;
use crate::metric::Metric;
use crate::storage::Storage;
use std::collections::HashMap;
use std::sync::RwLock;

/// A name-to-metric map behind a read-write lock.
///
/// The lock is not optional: HTTP handlers call `set`/`get` from multiple
/// request threads at once, and counter accumulation is a read-modify-write.
pub struct MemoryStorage {
    metrics: RwLock<HashMap<String, Metric>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> MemoryStorage {
        MemoryStorage {
            metrics: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> MemoryStorage {
        MemoryStorage::new()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, name: &str) -> Result<Metric, Error> {
        let map = self.metrics.read().expect("metrics lock poisoned");
        match map.get(name) {
            Some(m) => Ok(m.clone()),
            None => Err(Error::NotFound),
        }
    }

    fn set(&self, metric: Metric) -> Result<(), Error> {
        let mut map = self.metrics.write().expect("metrics lock poisoned");
        match map.get_mut(&metric.name) {
            Some(existing) => *existing += metric,
            None => {
                map.insert(metric.name.clone(), metric);
            }
        }
        Ok(())
    }

    fn set_all(&self, metrics: HashMap<String, Metric>) -> Result<(), Error> {
        let mut map = self.metrics.write().expect("metrics lock poisoned");
        for (name, metric) in metrics {
            match map.get_mut(&name) {
                Some(existing) => *existing += metric,
                None => {
                    map.insert(name, metric);
                }
            }
        }
        Ok(())
    }

    fn get_all(&self) -> Result<HashMap<String, Metric>, Error> {
        let map = self.metrics.read().expect("metrics lock poisoned");
        Ok(map.clone())
    }

    fn clear(&self) -> Result<(), Error> {
        let mut map = self.metrics.write().expect("metrics lock poisoned");
        map.clear();
        Ok(())
    }

    fn ping(&self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&self) {
        // nothing to release
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_unknown_is_not_found() {
        let store = MemoryStorage::new();
        match store.get("nope") {
            Err(Error::NotFound) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn counter_set_accumulates() {
        let store = MemoryStorage::new();
        store.set(Metric::counter("PollCount", 1)).unwrap();
        store.set(Metric::counter("PollCount", 1)).unwrap();
        assert_eq!(store.get("PollCount").unwrap().delta, Some(2));
    }

    #[test]
    fn gauge_set_overwrites() {
        let store = MemoryStorage::new();
        store.set(Metric::gauge("g", 1.0)).unwrap();
        store.set(Metric::gauge("g", 2.5)).unwrap();
        assert_eq!(store.get("g").unwrap().value, Some(2.5));
    }

    #[test]
    fn set_all_merges_each_entry() {
        let store = MemoryStorage::new();
        store.set(Metric::counter("c", 5)).unwrap();

        let mut batch = HashMap::new();
        batch.insert("c".to_string(), Metric::counter("c", 2));
        batch.insert("g".to_string(), Metric::gauge("g", 0.5));
        store.set_all(batch).unwrap();

        assert_eq!(store.get("c").unwrap().delta, Some(7));
        assert_eq!(store.get("g").unwrap().value, Some(0.5));
        assert_eq!(store.get_all().unwrap().len(), 2);
    }

    #[test]
    fn clear_removes_everything() {
        let store = MemoryStorage::new();
        store.set(Metric::gauge("g", 1.0)).unwrap();
        store.clear().unwrap();
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn concurrent_counter_writes_sum_exactly() {
        let store = Arc::new(MemoryStorage::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    store.set(Metric::counter("spins", 1)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get("spins").unwrap().delta, Some(800));
    }
}
