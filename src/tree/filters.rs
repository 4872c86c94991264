use crate::collections::BitArray;
use crate::tree::encoding::{FixedKey, FixedValue};
use std::collections::HashSet;
use std::sync::Arc;

/// Narrows a scan to a sequence of key windows. The scanner seeks to each
/// window start in turn and stops at the window end (exclusive).
pub trait SeekFilter<K: FixedKey>: Send {
    fn reset(&mut self);
    /// The next `[start, end)` window, in ascending key order.
    fn next_window(&mut self) -> Option<(K, K)>;
}

/// Plain interval-list seek filter. Windows must be pre-sorted and
/// non-overlapping.
#[derive(Clone)]
pub struct KeyRangeSeekFilter<K: FixedKey> {
    windows: Vec<(K, K)>,
    next: usize,
}

impl<K: FixedKey> KeyRangeSeekFilter<K> {
    pub fn new(windows: Vec<(K, K)>) -> Self {
        Self { windows, next: 0 }
    }

    /// A single-window filter covering `[start, end)`.
    pub fn range(start: K, end: K) -> Self {
        Self::new(vec![(start, end)])
    }
}

impl<K: FixedKey> SeekFilter<K> for KeyRangeSeekFilter<K> {
    fn reset(&mut self) {
        self.next = 0;
    }

    fn next_window(&mut self) -> Option<(K, K)> {
        let window = self.windows.get(self.next).cloned()?;
        self.next += 1;
        Some(window)
    }
}

/// Seek filter that consults an access predicate at every window
/// boundary; rejected windows are skipped entirely.
pub struct AccessControlledSeekFilter<K: FixedKey, F: SeekFilter<K>> {
    inner: F,
    allow: Arc<dyn Fn(&K, &K) -> bool + Send + Sync>,
}

impl<K: FixedKey, F: SeekFilter<K>> AccessControlledSeekFilter<K, F> {
    pub fn new(inner: F, allow: Arc<dyn Fn(&K, &K) -> bool + Send + Sync>) -> Self {
        Self { inner, allow }
    }
}

impl<K: FixedKey, F: SeekFilter<K>> SeekFilter<K> for AccessControlledSeekFilter<K, F> {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn next_window(&mut self) -> Option<(K, K)> {
        loop {
            let (start, end) = self.inner.next_window()?;
            if (self.allow)(&start, &end) {
                return Some((start, end));
            }
        }
    }
}

/// Per-record predicate applied during filtered reads.
pub trait MatchFilter<K: FixedKey, V: FixedValue>: Send + Sync {
    fn contains(&self, key: &K, value: &V) -> bool;
}

/// Dense small-id membership: one bit per id, O(1) per probe.
pub struct PointIdBitArray {
    bits: BitArray,
}

impl PointIdBitArray {
    pub fn new(ids: impl IntoIterator<Item = u64>, max_id: u64) -> Self {
        let mut bits = BitArray::new(max_id as usize + 1, false);
        for id in ids {
            bits.set(id as usize);
        }
        Self { bits }
    }
}

impl<V: FixedValue> MatchFilter<u64, V> for PointIdBitArray {
    fn contains(&self, key: &u64, _value: &V) -> bool {
        (*key as usize) < self.bits.len() && self.bits.get(*key as usize)
    }
}

/// Hash membership over 32-bit ids.
pub struct UIntHashSet {
    ids: HashSet<u32>,
}

impl UIntHashSet {
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }
}

impl<V: FixedValue> MatchFilter<u32, V> for UIntHashSet {
    fn contains(&self, key: &u32, _value: &V) -> bool {
        self.ids.contains(key)
    }
}

/// Hash membership over 64-bit ids.
pub struct ULongHashSet {
    ids: HashSet<u64>,
}

impl ULongHashSet {
    pub fn new(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }
}

impl<V: FixedValue> MatchFilter<u64, V> for ULongHashSet {
    fn contains(&self, key: &u64, _value: &V) -> bool {
        self.ids.contains(key)
    }
}

// Above this id range a bitmap stops paying for itself against a hash set.
const BIT_ARRAY_MAX_ID: u64 = 8 * 1024 * 1024;

/// Chooses a point-id match filter from domain statistics: dense small
/// domains get the bitmap, everything else hashes.
pub fn best_point_id_filter<V: FixedValue>(ids: &[u64]) -> Arc<dyn MatchFilter<u64, V>> {
    match ids.iter().max() {
        Some(&max_id) if max_id < BIT_ARRAY_MAX_ID => {
            Arc::new(PointIdBitArray::new(ids.iter().copied(), max_id))
        }
        Some(_) => Arc::new(ULongHashSet::new(ids.iter().copied())),
        None => Arc::new(ULongHashSet::new(std::iter::empty())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_range_filter_yields_in_order() {
        let mut filter = KeyRangeSeekFilter::new(vec![(0u64, 10), (20, 30)]);
        assert_eq!(filter.next_window(), Some((0, 10)));
        assert_eq!(filter.next_window(), Some((20, 30)));
        assert_eq!(filter.next_window(), None);
        filter.reset();
        assert_eq!(filter.next_window(), Some((0, 10)));
    }

    #[test]
    fn test_access_controlled_filter_skips_denied() {
        let inner = KeyRangeSeekFilter::new(vec![(0u64, 10), (20, 30), (40, 50)]);
        let mut filter =
            AccessControlledSeekFilter::new(inner, Arc::new(|start: &u64, _: &u64| *start != 20));
        assert_eq!(filter.next_window(), Some((0, 10)));
        assert_eq!(filter.next_window(), Some((40, 50)));
        assert_eq!(filter.next_window(), None);
    }

    #[test]
    fn test_point_id_bit_array() {
        let filter = PointIdBitArray::new([1u64, 5, 9], 9);
        assert!(MatchFilter::<u64, u64>::contains(&filter, &5, &0));
        assert!(!MatchFilter::<u64, u64>::contains(&filter, &4, &0));
        assert!(!MatchFilter::<u64, u64>::contains(&filter, &1000, &0));
    }

    #[test]
    fn test_factory_picks_by_domain() {
        let dense = best_point_id_filter::<u64>(&[1, 2, 3]);
        assert!(dense.contains(&2, &0));
        assert!(!dense.contains(&4, &0));

        let sparse = best_point_id_filter::<u64>(&[1, u64::MAX / 2]);
        assert!(sparse.contains(&(u64::MAX / 2), &0));
        assert!(!sparse.contains(&2, &0));
    }
}
