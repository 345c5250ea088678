use crate::utils::now_millis;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Bounded set of seen event ids shared by every relay handler.
///
/// Eviction is first-in-first-out: lookups go through `contains`/`peek`,
/// which leave the insertion order untouched, so the entry dropped when the
/// set is full is always the oldest insertion.
pub struct EventDeduplicator {
    seen: Mutex<LruCache<String, u64>>,
}

impl EventDeduplicator {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Records `event_id`. Returns `false` if it was already present.
    pub fn try_add(&self, event_id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap();
        if seen.contains(event_id) {
            return false;
        }
        seen.push(event_id.to_string(), now_millis());
        true
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.seen.lock().unwrap().contains(event_id)
    }

    /// Insertion timestamp (unix millis) of `event_id`, if still tracked.
    pub fn inserted_at(&self, event_id: &str) -> Option<u64> {
        self.seen.lock().unwrap().peek(event_id).copied()
    }

    pub fn remove(&self, event_id: &str) -> bool {
        self.seen.lock().unwrap().pop(event_id).is_some()
    }

    pub fn clear(&self) {
        self.seen.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.seen.lock().unwrap().cap().get()
    }
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
