use std::cell::RefCell;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::ReentrantMutex;

struct Entry {
    count: u64,
    last_seen: Instant,
}

/// Bounded LRU of (ip, hit count, last-seen) keyed by ip string.
///
/// Insertion order tracks recency: the front of the map is the least
/// recently touched ip, the back is the most recent. Because `touch` is
/// the only operation that updates `last_seen`, this also means front-to-
/// back order is ascending by idle time, which is what lets `len` sweep
/// from the front and stop at the first entry still within `ttl`.
///
/// Guarded by a re-entrant lock: `contains`/`count` lazily evict an idle
/// entry via `remove`, and a plain mutex would deadlock on that call.
pub struct IpQueue {
    capacity: usize,
    ttl: Duration,
    entries: ReentrantMutex<RefCell<IndexMap<String, Entry>>>,
}

impl IpQueue {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: ReentrantMutex::new(RefCell::new(IndexMap::new())),
        }
    }

    /// Inserts `ip` at MRU with `count=1`, or bumps and re-MRUs an existing
    /// entry. Evicts the LRU entry if this pushes the queue past capacity.
    pub fn touch(&self, ip: &str) {
        let guard = self.entries.lock();
        let mut entries = guard.borrow_mut();

        let count = entries.shift_remove(ip).map(|e| e.count + 1).unwrap_or(1);
        entries.insert(
            ip.to_string(),
            Entry {
                count,
                last_seen: Instant::now(),
            },
        );

        if entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
    }

    /// Current hit count for `ip`, or 0 if absent or idle-evicted.
    pub fn count(&self, ip: &str) -> u64 {
        let guard = self.entries.lock();
        let mut entries = guard.borrow_mut();
        self.evict_if_idle(&mut entries, ip);
        entries.get(ip).map(|e| e.count).unwrap_or(0)
    }

    pub fn contains(&self, ip: &str) -> bool {
        let guard = self.entries.lock();
        let mut entries = guard.borrow_mut();
        self.evict_if_idle(&mut entries, ip);
        entries.contains_key(ip)
    }

    pub fn remove(&self, ip: &str) {
        let guard = self.entries.lock();
        guard.borrow_mut().shift_remove(ip);
    }

    /// Sweeps idle entries from the LRU end, then returns the remaining
    /// size.
    pub fn len(&self) -> usize {
        let guard = self.entries.lock();
        let mut entries = guard.borrow_mut();
        let ttl = self.ttl;
        let now = Instant::now();
        while let Some((_, entry)) = entries.get_index(0) {
            if now.duration_since(entry.last_seen) > ttl {
                entries.shift_remove_index(0);
            } else {
                break;
            }
        }
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_if_idle(&self, entries: &mut IndexMap<String, Entry>, ip: &str) {
        if let Some(entry) = entries.get(ip) {
            if Instant::now().duration_since(entry.last_seen) > self.ttl {
                entries.shift_remove(ip);
            }
        }
    }
}
