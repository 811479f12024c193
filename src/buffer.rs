//! Bounded, time- and size-aware fragment buffer.
//!
//! [`FragmentBuffer`] is the plain data structure: an arrival-ordered `VecDeque` with
//! incrementally tracked count and byte totals. All of its operations are total; capacity
//! is enforced by the producer loop (backpressure or circular eviction), never by
//! rejecting a push.
//!
//! [`SharedBuffer`] owns the single buffer mutex and the condition variable that the
//! producer signals after merging data. Every access goes through a [`BufferGuard`],
//! which publishes the buffer depth to telemetry before the lock is released whenever
//! the guard was used mutably.
//!
//! # Accounting Invariant
//!
//! After every mutation `len()` and `size_bytes()` equal a full recount of the stored
//! fragments. Debug builds verify this on every mutation.

use crate::fragment::{Fragment, FragmentId, Timestamp};
use crate::telemetry::Telemetry;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Count and byte bounds for the buffer. A bound of zero is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferLimits {
    /// Maximum number of fragments (0 = unbounded)
    pub max_fragments: usize,
    /// Maximum cumulative bytes (0 = unbounded)
    pub max_bytes: usize,
}

impl BufferLimits {
    /// Limits with both bounds disabled.
    pub fn unbounded() -> Self {
        Self::default()
    }
}

/// Depth of the buffer at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    /// Number of buffered fragments
    pub fragments: usize,
    /// Cumulative accounted bytes
    pub bytes: usize,
}

/// Arrival-ordered collection of produced fragments.
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    fragments: VecDeque<Fragment>,
    bytes: usize,
    limits: BufferLimits,
}

impl FragmentBuffer {
    /// Create an empty buffer with the given bounds.
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            fragments: VecDeque::new(),
            bytes: 0,
            limits,
        }
    }

    /// Configured bounds.
    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    /// Number of buffered fragments.
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Whether the buffer holds no fragments.
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Cumulative accounted bytes.
    pub fn size_bytes(&self) -> usize {
        self.bytes
    }

    /// Current depth.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            fragments: self.fragments.len(),
            bytes: self.bytes,
        }
    }

    /// Depth computed from scratch, for checking the incremental totals.
    pub fn recount(&self) -> BufferStats {
        BufferStats {
            fragments: self.fragments.iter().count(),
            bytes: self.fragments.iter().map(Fragment::size_bytes).sum(),
        }
    }

    /// Iterate over fragments, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter()
    }

    /// True iff count exceeds `max_fragments` or bytes exceed `max_bytes`.
    pub fn is_too_large(&self) -> bool {
        (self.limits.max_fragments > 0 && self.fragments.len() > self.limits.max_fragments)
            || (self.limits.max_bytes > 0 && self.bytes > self.limits.max_bytes)
    }

    /// Timestamp of the oldest (first arrived) fragment.
    pub fn oldest_timestamp(&self) -> Option<Timestamp> {
        self.fragments.front().map(Fragment::timestamp)
    }

    /// Timestamp of the newest (last arrived) fragment.
    pub fn newest_timestamp(&self) -> Option<Timestamp> {
        self.fragments.back().map(Fragment::timestamp)
    }

    /// Append a fragment.
    pub fn push(&mut self, fragment: Fragment) {
        self.bytes += fragment.size_bytes();
        self.fragments.push_back(fragment);
        self.check_accounting();
    }

    /// Append a fragment, then evict the oldest data until the buffer fits.
    ///
    /// Returns the number of evicted fragments.
    pub fn push_circular(&mut self, fragment: Fragment) -> usize {
        self.push(fragment);
        self.evict_until_fits()
    }

    /// Evict from the front until the buffer is no longer too large.
    pub fn evict_until_fits(&mut self) -> usize {
        let mut evicted = 0;
        while self.is_too_large() {
            if self.evict_front().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    /// Remove and return the oldest fragment.
    pub fn evict_front(&mut self) -> Option<Fragment> {
        let fragment = self.fragments.pop_front()?;
        self.bytes -= fragment.size_bytes();
        self.check_accounting();
        Some(fragment)
    }

    /// Remove every fragment older than `newest_timestamp - stale_timeout`.
    ///
    /// `None` disables pruning. Returns the number of removed fragments.
    pub fn prune_stale(
        &mut self,
        newest_timestamp: Timestamp,
        stale_timeout: Option<u64>,
    ) -> usize {
        let Some(timeout) = stale_timeout else {
            return 0;
        };
        let threshold = newest_timestamp.saturating_sub(timeout);
        self.extract(|frag| frag.timestamp() < threshold).len()
    }

    /// Empty the buffer, returning every fragment in arrival order.
    pub fn drain_all(&mut self) -> Vec<Fragment> {
        self.bytes = 0;
        let drained: Vec<Fragment> = self.fragments.drain(..).collect();
        self.check_accounting();
        drained
    }

    /// Remove every fragment.
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.bytes = 0;
    }

    /// Merge for Single mode: keep only the most recent complete event.
    ///
    /// An event is `event_size` fragments (one per configured fragment id). When the new
    /// batch holds at least one full event, it replaces the buffer; otherwise it is
    /// appended and older fragments are dropped until one event's worth remains.
    /// Returns the number of discarded fragments.
    pub fn replace_latest_event(
        &mut self,
        mut incoming: Vec<Fragment>,
        event_size: usize,
    ) -> usize {
        let event_size = event_size.max(1);
        let mut discarded = 0;
        if incoming.len() >= event_size {
            discarded += self.fragments.len();
            self.clear();
            let skip = incoming.len() - event_size;
            discarded += skip;
            for fragment in incoming.drain(skip..) {
                self.push(fragment);
            }
        } else {
            for fragment in incoming {
                self.push(fragment);
            }
            while self.fragments.len() > event_size {
                self.evict_front();
                discarded += 1;
            }
        }
        discarded
    }

    /// Remove and return every fragment of `fragment_id`, in arrival order.
    pub fn take_all_by_fragment_id(&mut self, fragment_id: FragmentId) -> Vec<Fragment> {
        self.extract(|frag| frag.fragment_id() == fragment_id)
    }

    /// The last `event_size` fragments, oldest first.
    pub fn latest_event(&self, event_size: usize) -> impl Iterator<Item = &Fragment> {
        let skip = self.fragments.len().saturating_sub(event_size);
        self.fragments.iter().skip(skip)
    }

    /// Fragments of `fragment_id` whose timestamp falls in the request window.
    ///
    /// The window is `[min, max)` when `width > 0` and the single point `[min, min]`
    /// otherwise. With `remove` the matched fragments are moved out of the buffer;
    /// without it they are cloned and stay available to overlapping windows.
    pub fn collect_window(
        &mut self,
        fragment_id: FragmentId,
        min: Timestamp,
        max: Timestamp,
        width: u64,
        remove: bool,
    ) -> Vec<Fragment> {
        let in_window = |frag: &Fragment| {
            frag.fragment_id() == fragment_id
                && frag.timestamp() >= min
                && (frag.timestamp() < max || (width == 0 && frag.timestamp() == max))
        };
        if remove {
            self.extract(in_window)
        } else {
            self.fragments
                .iter()
                .filter(|frag| in_window(frag))
                .cloned()
                .collect()
        }
    }

    fn extract(&mut self, mut predicate: impl FnMut(&Fragment) -> bool) -> Vec<Fragment> {
        let mut kept = VecDeque::with_capacity(self.fragments.len());
        let mut taken = Vec::new();
        for fragment in self.fragments.drain(..) {
            if predicate(&fragment) {
                self.bytes -= fragment.size_bytes();
                taken.push(fragment);
            } else {
                kept.push_back(fragment);
            }
        }
        self.fragments = kept;
        self.check_accounting();
        taken
    }

    #[inline]
    fn check_accounting(&self) {
        #[cfg(debug_assertions)]
        {
            let recount = self.recount();
            debug_assert_eq!(recount, self.stats(), "buffer accounting drifted");
        }
    }
}

/// Fragment buffer guarded by one mutex and one condition variable.
#[derive(Debug)]
pub struct SharedBuffer {
    inner: Mutex<FragmentBuffer>,
    ready: Condvar,
    telemetry: Telemetry,
}

impl SharedBuffer {
    /// Create an empty shared buffer.
    pub fn new(limits: BufferLimits, telemetry: Telemetry) -> Self {
        Self {
            inner: Mutex::new(FragmentBuffer::new(limits)),
            ready: Condvar::new(),
            telemetry,
        }
    }

    /// Take the buffer lock.
    pub fn lock(&self) -> BufferGuard<'_> {
        BufferGuard {
            guard: self.inner.lock(),
            telemetry: &self.telemetry,
            dirty: false,
        }
    }

    /// Wait on the buffer condition variable for at most `timeout`.
    ///
    /// Returns `true` if the wait timed out.
    pub fn wait_for(&self, guard: &mut BufferGuard<'_>, timeout: Duration) -> bool {
        self.ready.wait_for(&mut guard.guard, timeout).timed_out()
    }

    /// Wake every thread waiting on the buffer.
    pub fn notify(&self) {
        self.ready.notify_all();
    }

    /// Depth without holding the lock longer than a read.
    pub fn stats(&self) -> BufferStats {
        self.inner.lock().stats()
    }
}

/// Exclusive access to the buffer.
///
/// Publishes depth to telemetry on drop when the buffer was borrowed mutably.
pub struct BufferGuard<'a> {
    guard: MutexGuard<'a, FragmentBuffer>,
    telemetry: &'a Telemetry,
    dirty: bool,
}

impl Deref for BufferGuard<'_> {
    type Target = FragmentBuffer;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.dirty = true;
        &mut self.guard
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        if self.dirty {
            let stats = self.guard.stats();
            self.telemetry.buffer_depth(stats.fragments, stats.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FRAGMENT_HEADER_BYTES;
    use crate::telemetry::ReadoutMetrics;

    fn frag(ts: Timestamp) -> Fragment {
        Fragment::data(ts, 0, ts, vec![0u8; 8])
    }

    #[test]
    fn test_push_and_evict_track_size() {
        let mut buffer = FragmentBuffer::new(BufferLimits::unbounded());
        buffer.push(frag(1));
        buffer.push(frag(2));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.size_bytes(), 2 * (FRAGMENT_HEADER_BYTES + 8));

        let oldest = buffer.evict_front().unwrap();
        assert_eq!(oldest.timestamp(), 1);
        assert_eq!(buffer.stats(), buffer.recount());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_too_large_by_count_and_bytes() {
        let mut by_count = FragmentBuffer::new(BufferLimits {
            max_fragments: 2,
            max_bytes: 0,
        });
        by_count.push(frag(1));
        by_count.push(frag(2));
        assert!(!by_count.is_too_large());
        by_count.push(frag(3));
        assert!(by_count.is_too_large());

        let per_frag = FRAGMENT_HEADER_BYTES + 8;
        let mut by_bytes = FragmentBuffer::new(BufferLimits {
            max_fragments: 0,
            max_bytes: per_frag * 2,
        });
        by_bytes.push(frag(1));
        by_bytes.push(frag(2));
        assert!(!by_bytes.is_too_large());
        by_bytes.push(frag(3));
        assert!(by_bytes.is_too_large());
        by_bytes.evict_front();
        assert!(!by_bytes.is_too_large());
    }

    #[test]
    fn test_unbounded_never_too_large() {
        let mut buffer = FragmentBuffer::new(BufferLimits::unbounded());
        for ts in 0..1000 {
            buffer.push(frag(ts));
        }
        assert!(!buffer.is_too_large());
    }

    #[test]
    fn test_circular_keeps_most_recent() {
        let mut buffer = FragmentBuffer::new(BufferLimits {
            max_fragments: 3,
            max_bytes: 0,
        });
        let evicted: usize = (1..=5).map(|ts| buffer.push_circular(frag(ts))).sum();
        assert_eq!(evicted, 2);
        let remaining: Vec<_> = buffer.iter().map(Fragment::timestamp).collect();
        assert_eq!(remaining, vec![3, 4, 5]);
        assert_eq!(buffer.stats(), buffer.recount());
    }

    #[test]
    fn test_prune_stale() {
        let mut buffer = FragmentBuffer::new(BufferLimits::unbounded());
        for ts in [10, 50, 90, 100] {
            buffer.push(frag(ts));
        }
        assert_eq!(buffer.prune_stale(100, None), 0);
        assert_eq!(buffer.prune_stale(100, Some(50)), 1);
        let remaining: Vec<_> = buffer.iter().map(Fragment::timestamp).collect();
        assert_eq!(remaining, vec![50, 90, 100]);
        assert_eq!(buffer.stats(), buffer.recount());
    }

    #[test]
    fn test_drain_all_empties_buffer() {
        let mut buffer = FragmentBuffer::new(BufferLimits::unbounded());
        buffer.push(frag(1));
        buffer.push(frag(2));
        let drained = buffer.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.size_bytes(), 0);
    }

    #[test]
    fn test_replace_latest_event() {
        let mut buffer = FragmentBuffer::new(BufferLimits::unbounded());
        let batch: Vec<_> = (0..5)
            .map(|i| Fragment::data(1, (i % 2) as FragmentId, i, vec![0u8; 4]))
            .collect();
        let discarded = buffer.replace_latest_event(batch, 2);
        assert_eq!(discarded, 3);
        let kept: Vec<_> = buffer.iter().map(Fragment::timestamp).collect();
        assert_eq!(kept, vec![3, 4]);

        // A partial event is appended and the oldest data trimmed
        buffer.replace_latest_event(vec![Fragment::data(2, 0, 9, vec![0u8; 4])], 2);
        let kept: Vec<_> = buffer.iter().map(Fragment::timestamp).collect();
        assert_eq!(kept, vec![4, 9]);
        assert_eq!(buffer.stats(), buffer.recount());
    }

    #[test]
    fn test_collect_window_boundaries() {
        let mut buffer = FragmentBuffer::new(BufferLimits::unbounded());
        for ts in [120, 140, 160, 250] {
            buffer.push(frag(ts));
        }
        let hits: Vec<_> = buffer
            .collect_window(0, 50, 150, 100, false)
            .iter()
            .map(Fragment::timestamp)
            .collect();
        assert_eq!(hits, vec![120, 140]);
        assert_eq!(buffer.len(), 4);

        // max is exclusive for a non-zero width
        let hits = buffer.collect_window(0, 160, 250, 90, true);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].timestamp(), 160);
        assert_eq!(buffer.len(), 3);

        // zero width matches exactly min
        let hits = buffer.collect_window(0, 250, 250, 0, true);
        assert_eq!(hits.len(), 1);
        assert_eq!(buffer.stats(), buffer.recount());
    }

    #[test]
    fn test_take_all_by_fragment_id() {
        let mut buffer = FragmentBuffer::new(BufferLimits::unbounded());
        for ts in 0..6 {
            buffer.push(Fragment::data(ts, (ts % 3) as FragmentId, ts, vec![0u8; 2]));
        }
        let taken: Vec<_> = buffer
            .take_all_by_fragment_id(1)
            .iter()
            .map(Fragment::timestamp)
            .collect();
        assert_eq!(taken, vec![1, 4]);
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.stats(), buffer.recount());
    }

    #[test]
    fn test_collect_window_filters_fragment_id() {
        let mut buffer = FragmentBuffer::new(BufferLimits::unbounded());
        buffer.push(Fragment::data(1, 0, 10, vec![0u8; 1]));
        buffer.push(Fragment::data(1, 1, 10, vec![0u8; 1]));
        let hits = buffer.collect_window(1, 0, 100, 100, true);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fragment_id(), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_guard_publishes_depth_on_mutation() {
        let metrics = ReadoutMetrics::new();
        let shared = SharedBuffer::new(BufferLimits::unbounded(), Telemetry::new(metrics.clone()));
        {
            let mut guard = shared.lock();
            guard.push(frag(1));
            guard.push(frag(2));
        }
        assert_eq!(metrics.snapshot().buffer_fragments, 2);
        {
            let mut guard = shared.lock();
            guard.evict_front();
        }
        assert_eq!(metrics.snapshot().buffer_fragments, 1);
        assert_eq!(shared.stats().fragments, 1);
    }

    #[test]
    fn test_wait_for_times_out_without_data() {
        let shared = SharedBuffer::new(BufferLimits::unbounded(), Telemetry::disabled());
        let mut guard = shared.lock();
        assert!(shared.wait_for(&mut guard, Duration::from_millis(5)));
    }
}
