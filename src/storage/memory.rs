use super::UsageEntry;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// In-memory usage store shared by every request handler and the sweeper.
///
/// Mutation goes through the map's entry API, which holds the shard lock for
/// the duration of the caller's closure. That is what makes the
/// check-then-increment sequence atomic per key: two concurrent checks for
/// the same key serialize instead of both reading the pre-increment count.
#[derive(Clone)]
pub struct MemoryStorage {
    entries: Arc<DashMap<String, UsageEntry>>,
    //source of window generation stamps
    next_generation: Arc<AtomicU64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Snapshot of the entry for a key. Never allocates a slot, so read-only
    /// callers leave the map untouched.
    pub fn get(&self, key: &str) -> Option<UsageEntry> {
        self.entries.get(key).map(|slot| *slot.value())
    }

    /// Run `apply` with exclusive access to the live entry for `key`.
    ///
    /// A missing entry, or one whose window has fully elapsed, is replaced
    /// with a fresh zeroed entry (new generation stamp) before `apply` runs.
    /// The closure must not touch this store again or it will deadlock on
    /// the shard lock.
    pub fn with_current_entry<R>(
        &self,
        key: &str,
        window: Duration,
        apply: impl FnOnce(&mut UsageEntry, Instant) -> R,
    ) -> R {
        let now = Instant::now();
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| UsageEntry::fresh(now, self.next_stamp()));
        if slot.is_expired(now, window) {
            *slot = UsageEntry::fresh(now, self.next_stamp());
        }
        apply(slot.value_mut(), now)
    }

    /// Run `apply` on an existing entry. Absent keys stay absent and yield
    /// `None` — no slot is created on this path.
    pub fn with_existing_entry<R>(
        &self,
        key: &str,
        apply: impl FnOnce(&mut UsageEntry) -> R,
    ) -> Option<R> {
        self.entries
            .get_mut(key)
            .map(|mut slot| apply(slot.value_mut()))
    }

    /// Drop every entry whose window began more than `horizon` ago.
    /// Returns how many entries were evicted.
    pub fn evict_stale(&self, horizon: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.window_start.elapsed() <= horizon);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_stamp(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn first_access_creates_a_zeroed_entry() {
        let storage = MemoryStorage::new();
        let (count, bytes) = storage.with_current_entry("k", WINDOW, |entry, _| {
            (entry.count, entry.total_bytes)
        });
        assert_eq!((count, bytes), (0, 0));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn expired_entry_is_replaced_with_a_new_generation() {
        let storage = MemoryStorage::new();
        let window = Duration::from_millis(10);
        let first = storage.with_current_entry("k", window, |entry, _| {
            entry.count = 3;
            entry.total_bytes = 100;
            entry.generation
        });
        std::thread::sleep(Duration::from_millis(30));
        let (count, bytes, second) = storage.with_current_entry("k", window, |entry, _| {
            (entry.count, entry.total_bytes, entry.generation)
        });
        assert_eq!((count, bytes), (0, 0));
        assert_ne!(first, second);
    }

    #[test]
    fn get_does_not_allocate() {
        let storage = MemoryStorage::new();
        assert!(storage.get("missing").is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn with_existing_entry_skips_missing_keys() {
        let storage = MemoryStorage::new();
        assert!(storage.with_existing_entry("missing", |_| ()).is_none());
        assert!(storage.is_empty());
    }

    #[test]
    fn evict_stale_only_drops_entries_past_the_horizon() {
        let storage = MemoryStorage::new();
        storage.with_current_entry("old", WINDOW, |_, _| ());
        std::thread::sleep(Duration::from_millis(60));
        storage.with_current_entry("live", WINDOW, |_, _| ());

        assert_eq!(storage.evict_stale(Duration::from_millis(40)), 1);
        assert!(storage.get("old").is_none());
        assert!(storage.get("live").is_some());
    }
}
