//! Time-windowed duplicate detection.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// Sliding window of recently seen keys.
///
/// Entries leave the window once they are older than the horizon, or when
/// the window is full and a newer key arrives.
#[derive(Debug)]
pub struct DedupWindow<K> {
    /// Key to insertion instant and sequence number, for O(1) lookups.
    seen: HashMap<K, (Instant, u64)>,
    /// Insertion order, for expiry. May hold entries for removed keys.
    order: VecDeque<(K, Instant, u64)>,
    next_seq: u64,
    horizon: Duration,
    capacity: usize,
}

impl<K: Hash + Eq + Copy> DedupWindow<K> {
    pub fn new(horizon: Duration, capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            horizon,
            capacity: capacity.max(1),
        }
    }

    /// Check if `key` is a duplicate. Returns true if it was already in the
    /// window; otherwise records it and returns false.
    pub fn check_and_insert(&mut self, key: K, now: Instant) -> bool {
        self.expire(now);

        if self.seen.contains_key(&key) {
            return true;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.seen.insert(key, (now, seq));
        self.order.push_back((key, now, seq));

        while self.seen.len() > self.capacity {
            let Some((old, _, seq)) = self.order.pop_front() else {
                break;
            };
            self.forget_entry(old, seq);
        }

        false
    }

    /// Forget `key` so that it is no longer reported as a duplicate.
    pub fn remove(&mut self, key: &K) -> bool {
        self.seen.remove(key).is_some()
    }

    pub fn contains(&self, key: &K, now: Instant) -> bool {
        self.seen
            .get(key)
            .is_some_and(|(inserted, _)| now.duration_since(*inserted) < self.horizon)
    }

    /// Drop entries older than the horizon.
    pub fn expire(&mut self, now: Instant) {
        while let Some(&(key, inserted, seq)) = self.order.front() {
            if now.duration_since(inserted) < self.horizon {
                break;
            }
            self.order.pop_front();
            self.forget_entry(key, seq);
        }
    }

    /// Drop `key` only if the window still holds insertion `seq`. A removed
    /// and re-inserted key has a newer entry.
    fn forget_entry(&mut self, key: K, seq: u64) {
        if self.seen.get(&key).is_some_and(|&(_, current)| current == seq) {
            self.seen.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_detects_duplicates() {
        let now = Instant::now();
        let mut window = DedupWindow::new(Duration::from_secs(5), 10);
        assert!(!window.check_and_insert(1u64, now));
        assert!(window.check_and_insert(1, now)); // Duplicate
        assert!(!window.check_and_insert(2, now));
        assert!(window.check_and_insert(2, now)); // Duplicate
    }

    #[test]
    fn test_dedup_window_capacity() {
        let now = Instant::now();
        let mut window = DedupWindow::new(Duration::from_secs(5), 3);
        assert!(!window.check_and_insert(1u64, now));
        assert!(!window.check_and_insert(2, now));
        assert!(!window.check_and_insert(3, now));
        // Window full: [1, 2, 3]
        assert!(!window.check_and_insert(4, now)); // Pushes out 1
        assert!(!window.check_and_insert(1, now)); // 1 is no longer in window
        assert!(window.check_and_insert(4, now));
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_dedup_entries_expire_after_horizon() {
        let start = Instant::now();
        let mut window = DedupWindow::new(Duration::from_millis(100), 10);
        assert!(!window.check_and_insert((7u64, 0u16), start));

        let before = start + Duration::from_millis(99);
        assert!(window.contains(&(7, 0), before));
        assert!(window.check_and_insert((7, 0), before));

        let after = start + Duration::from_millis(100);
        assert!(!window.contains(&(7, 0), after));
        assert!(!window.check_and_insert((7, 0), after));
    }

    #[test]
    fn test_removed_key_is_new_again() {
        let start = Instant::now();
        let mut window = DedupWindow::new(Duration::from_millis(100), 10);
        assert!(!window.check_and_insert(3u64, start));

        assert!(window.remove(&3));
        assert!(!window.remove(&3));
        assert!(!window.contains(&3, start));

        // Re-inserted later; the stale entry must not expire the new one.
        let later = start + Duration::from_millis(60);
        assert!(!window.check_and_insert(3, later));
        window.expire(start + Duration::from_millis(120));
        assert!(window.contains(&3, start + Duration::from_millis(120)));
        assert!(window.check_and_insert(3, start + Duration::from_millis(120)));
    }

    #[test]
    fn test_reinserted_key_counts_as_newest() {
        let now = Instant::now();
        let mut window = DedupWindow::new(Duration::from_secs(5), 2);
        assert!(!window.check_and_insert(1u64, now));
        assert!(!window.check_and_insert(2, now));
        window.remove(&1);
        assert!(!window.check_and_insert(1, now));

        // 2 is now the oldest live key and makes room for 3.
        assert!(!window.check_and_insert(3, now));
        assert!(window.contains(&1, now));
        assert!(!window.contains(&2, now));
        assert!(window.contains(&3, now));
    }

    #[test]
    fn test_dedup_expire_empties_window() {
        let start = Instant::now();
        let mut window = DedupWindow::new(Duration::from_millis(10), 10);
        window.check_and_insert(1u32, start);
        window.check_and_insert(2u32, start + Duration::from_millis(5));

        window.expire(start + Duration::from_millis(12));
        assert_eq!(window.len(), 1);
        window.expire(start + Duration::from_millis(20));
        assert!(window.is_empty());
    }
}
