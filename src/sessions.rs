//! Bounded session cache.
//!
//! Maps session ids to shared, individually locked values (one
//! [`crate::orchestrator::Orchestrator`] per session in the server). When an
//! insert pushes the cache past its capacity, the oldest-inserted entries
//! are evicted first. Lookups do not refresh an entry's position.
//!
//! The map itself sits behind a `std::sync::Mutex` held only for map
//! operations. Each value has its own `tokio::sync::Mutex`, which callers
//! hold for the duration of a turn; this serialises turns within a session
//! while different sessions run concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

pub type Shared<T> = Arc<tokio::sync::Mutex<T>>;

struct Entries<T> {
    order: VecDeque<String>,
    map: HashMap<String, Shared<T>>,
}

pub struct SessionCache<T> {
    capacity: usize,
    entries: Mutex<Entries<T>>,
}

impl<T> SessionCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries {
                order: VecDeque::new(),
                map: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries<T>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The value for `id`, creating it with `make` if absent.
    pub fn get_or_create(&self, id: &str, make: impl FnOnce() -> T) -> Shared<T> {
        let mut entries = self.lock();
        if let Some(existing) = entries.map.get(id) {
            return existing.clone();
        }

        let value = Arc::new(tokio::sync::Mutex::new(make()));
        entries.map.insert(id.to_string(), value.clone());
        entries.order.push_back(id.to_string());

        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.map.remove(&oldest);
                debug!(session = %oldest, "evicted session");
            }
        }
        value
    }

    pub fn get(&self, id: &str) -> Option<Shared<T>> {
        self.lock().map.get(id).cloned()
    }

    /// Remove `id`. Returns whether it was present.
    pub fn evict(&self, id: &str) -> bool {
        let mut entries = self.lock();
        if entries.map.remove(id).is_some() {
            entries.order.retain(|s| s != id);
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.map.clear();
        entries.order.clear();
    }

    /// Session ids, oldest first.
    pub fn session_ids(&self) -> Vec<String> {
        self.lock().order.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
