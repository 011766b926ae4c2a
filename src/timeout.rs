//! The idle-timeout sweeper from spec.md §4.3 and §9: an append-only,
//! tombstoned log of `(handler, last_activity)` entries plus a lazily
//! advancing cursor. This is the "central trick" spec.md §9 calls out
//! — it is what keeps `record_activity` O(1) amortised instead of
//! requiring an O(n) search-and-remove on every bit of I/O.
//!
//! No teacher module does exactly this (`quinn-proto`'s idle timer is
//! a per-connection timer-wheel entry driven by `Io::TimerStart`, not
//! a shared sweep log), so the compaction algorithm here is grounded
//! directly on spec.md §4.3/§9 and the distilled Python original.

use fnv::FnvHashMap;

use crate::server::HandlerId;

/// How often the sweep may run, and how often a given handler's
/// position in the log may be bumped. 4s in the original.
pub const TIMEOUT_PRECISION: u64 = 4;

/// Trigger for lazy compaction: the cursor must have walked past this
/// many entries *and* past half the log before a compaction runs.
pub const TIMEOUTS_CLEAN_SIZE: usize = 512;

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: HandlerId,
    last_activity: u64,
}

/// FIFO-ordered append log of handler references with tombstones,
/// owned by `Server` (spec.md §3).
#[derive(Debug, Default)]
pub struct TimeoutQueue {
    entries: Vec<Option<Entry>>,
    index: FnvHashMap<u64, usize>,
    cursor: usize,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        TimeoutQueue {
            entries: Vec::new(),
            index: FnvHashMap::default(),
            cursor: 0,
        }
    }

    /// Registers a freshly constructed handler's first activity
    /// timestamp. Must be called exactly once per handler, before any
    /// call to `touch` or `remove` for that id.
    pub fn insert(&mut self, id: HandlerId, now: u64) {
        self.push(id, now);
    }

    /// Called on every I/O event for a live handler. `prior_activity`
    /// is the handler's own `last_activity` field *before* this call.
    /// Returns `true` (and bumps the log) if at least
    /// [`TIMEOUT_PRECISION`] seconds have elapsed since then; returns
    /// `false` as a no-op otherwise, matching spec.md §4.3's rate
    /// limiter so churny connections don't grow the log unboundedly.
    pub fn touch(&mut self, id: HandlerId, now: u64, prior_activity: u64) -> bool {
        if now.saturating_sub(prior_activity) < TIMEOUT_PRECISION {
            return false;
        }
        if let Some(&pos) = self.index.get(&id.0) {
            self.entries[pos] = None;
        }
        self.push(id, now);
        true
    }

    fn push(&mut self, id: HandlerId, now: u64) {
        let pos = self.entries.len();
        self.entries.push(Some(Entry {
            id,
            last_activity: now,
        }));
        self.index.insert(id.0, pos);
    }

    /// Unconditionally drops `id` from the index, tombstoning its
    /// slot. Called from `Handler::destroy` on every teardown path so
    /// invariant 1 (no timeout-index entry survives destruction) holds
    /// regardless of how the handler died.
    pub fn remove(&mut self, id: HandlerId) {
        if let Some(pos) = self.index.remove(&id.0) {
            self.entries[pos] = None;
        }
    }

    /// Walks forward from the cursor. Skips tombstones. Stops at the
    /// first live entry fresher than `timeout` seconds (the
    /// non-tombstone subsequence is activity-monotone, so everything
    /// after is fresher too). Everything it walked past that *was*
    /// expired is tombstoned and returned for the caller to destroy.
    pub fn sweep(&mut self, now: u64, timeout: u64) -> Vec<HandlerId> {
        let mut expired = Vec::new();
        while self.cursor < self.entries.len() {
            match self.entries[self.cursor] {
                None => self.cursor += 1,
                Some(entry) => {
                    if now.saturating_sub(entry.last_activity) < timeout {
                        break;
                    }
                    expired.push(entry.id);
                    self.entries[self.cursor] = None;
                    self.index.remove(&entry.id.0);
                    self.cursor += 1;
                }
            }
        }
        self.maybe_compact();
        expired
    }

    fn maybe_compact(&mut self) {
        let dropped = self.cursor;
        if dropped > TIMEOUTS_CLEAN_SIZE && dropped > self.entries.len() / 2 {
            self.entries.drain(0..dropped);
            for pos in self.index.values_mut() {
                *pos -= dropped;
            }
            self.cursor = 0;
        }
    }

    #[cfg(test)]
    pub fn live_activity_sequence(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter_map(|e| e.map(|e| e.last_activity))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> HandlerId {
        HandlerId(n)
    }

    #[test]
    fn touch_is_a_rate_limited_noop() {
        let mut q = TimeoutQueue::new();
        q.insert(id(1), 100);
        assert!(!q.touch(id(1), 102, 100));
        assert!(q.touch(id(1), 105, 100));
    }

    #[test]
    fn sweep_destroys_only_entries_past_timeout_and_stops_at_first_fresh() {
        let mut q = TimeoutQueue::new();
        q.insert(id(1), 0);
        q.insert(id(2), 10);
        q.insert(id(3), 20);
        // timeout=15: id 1 (age 30) and id 2 (age 20) expire, id 3 (age 10) is fresh.
        let expired = q.sweep(30, 15);
        assert_eq!(expired, vec![id(1), id(2)]);
        let expired_again = q.sweep(30, 15);
        assert!(expired_again.is_empty());
    }

    #[test]
    fn remove_is_idempotent_and_clears_index() {
        let mut q = TimeoutQueue::new();
        q.insert(id(1), 0);
        q.remove(id(1));
        q.remove(id(1));
        assert!(q.index.get(&1).is_none());
        let expired = q.sweep(1000, 1);
        assert!(expired.is_empty());
    }

    #[test]
    fn activity_order_stays_non_decreasing_across_touches() {
        let mut q = TimeoutQueue::new();
        q.insert(id(1), 0);
        q.insert(id(2), 5);
        assert!(q.touch(id(1), 20, 0));
        let seq = q.live_activity_sequence();
        let mut sorted = seq.clone();
        sorted.sort_unstable();
        assert_eq!(seq, sorted);
    }

    #[test]
    fn compaction_preserves_index_and_order_invariants() {
        let mut q = TimeoutQueue::new();
        for n in 0..1100u64 {
            q.insert(id(n), n);
        }
        // Expire the first 600 by sweeping with a small timeout relative to "now".
        let expired = q.sweep(600, 1);
        assert_eq!(expired.len(), 600);
        assert!(q.cursor > TIMEOUTS_CLEAN_SIZE);
        // A live id still maps to a position whose entry matches it.
        for n in 600..1100u64 {
            let pos = *q.index.get(&n).unwrap();
            assert_eq!(q.entries[pos].unwrap().id, id(n));
        }
    }
}
