use crate::collections::NullableLargeArray;
use crate::error::Result;
use crate::tree::encoding::{FixedKey, FixedValue};
use crate::tree::filters::{MatchFilter, SeekFilter};
use crate::tree::scanner::TreeScanner;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

struct Source<K: FixedKey, V: FixedValue> {
    scanner: TreeScanner<K, V>,
    seek: Option<Box<dyn SeekFilter<K>>>,
    window_end: Option<K>,
    done: bool,
}

impl<K: FixedKey, V: FixedValue> Source<K, V> {
    /// Next in-window record from this source, honoring its seek filter.
    fn next(&mut self) -> Result<Option<(K, V)>> {
        let mut key = K::default();
        let mut value = V::default();
        while !self.done {
            match (self.seek.is_some(), &self.window_end) {
                (false, _) => {
                    if self.scanner.read(&mut key, &mut value)? {
                        return Ok(Some((key, value)));
                    }
                    self.done = true;
                }
                (true, Some(end)) => {
                    let bound = end.clone();
                    if self.scanner.read_while(&bound, &mut key, &mut value)? {
                        return Ok(Some((key, value)));
                    }
                    // Window exhausted; move to the next one.
                    if !self.enter_next_window()? {
                        self.done = true;
                    }
                }
                (true, None) => {
                    if !self.enter_next_window()? {
                        self.done = true;
                    }
                }
            }
        }
        Ok(None)
    }

    fn enter_next_window(&mut self) -> Result<bool> {
        let filter = self.seek.as_mut().expect("windowed source");
        match filter.next_window() {
            Some((start, end)) => {
                self.scanner.seek(&start)?;
                self.window_end = Some(end);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// K-way merge across sub-file scanners, yielding records in global key
/// order. Equal keys break toward the earlier source index, so the output
/// is deterministic. Seek filters push down to every source; match
/// filters apply post-merge via [`UnionTreeStream::read_and_filter`].
pub struct UnionTreeStream<K: FixedKey, V: FixedValue> {
    sources: Vec<Source<K, V>>,
    heap: BinaryHeap<Reverse<(K, usize)>>,
    /// Staged value per heap-resident source, indexed by source.
    staged: NullableLargeArray<V>,
}

impl<K: FixedKey, V: FixedValue> UnionTreeStream<K, V> {
    pub fn new(scanners: Vec<TreeScanner<K, V>>) -> Result<Self> {
        Self::build(
            scanners
                .into_iter()
                .map(|scanner| Source {
                    scanner,
                    seek: None,
                    window_end: None,
                    done: false,
                })
                .collect(),
        )
    }

    /// Pushes an independent copy of the seek filter down to each source.
    pub fn with_seek_filter(
        scanners: Vec<TreeScanner<K, V>>,
        filter_for_source: impl Fn() -> Box<dyn SeekFilter<K>>,
    ) -> Result<Self> {
        let sources: Vec<Source<K, V>> = scanners
            .into_iter()
            .map(|scanner| {
                let mut seek = filter_for_source();
                seek.reset();
                Source {
                    scanner,
                    seek: Some(seek),
                    window_end: None,
                    done: false,
                }
            })
            .collect();
        Self::build(sources)
    }

    fn build(mut sources: Vec<Source<K, V>>) -> Result<Self> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        let mut staged = NullableLargeArray::new();
        for (index, source) in sources.iter_mut().enumerate() {
            if let Some((key, value)) = source.next()? {
                heap.push(Reverse((key, index)));
                staged.set_value(index, value);
            }
        }
        Ok(Self {
            sources,
            heap,
            staged,
        })
    }

    /// Pops the globally smallest record. Returns false when every source
    /// is exhausted.
    pub fn read(&mut self, key: &mut K, value: &mut V) -> Result<bool> {
        let Reverse((min_key, index)) = match self.heap.pop() {
            Some(top) => top,
            None => return Ok(false),
        };
        *key = min_key;
        *value = self.staged.set_null(index).expect("source value staged");

        if let Some((next_key, next_value)) = self.sources[index].next()? {
            self.heap.push(Reverse((next_key, index)));
            self.staged.set_value(index, next_value);
        }
        Ok(true)
    }

    /// `read` with a post-merge match predicate.
    pub fn read_and_filter(
        &mut self,
        filter: &dyn MatchFilter<K, V>,
        key: &mut K,
        value: &mut V,
    ) -> Result<bool> {
        loop {
            if !self.read(key, value)? {
                return Ok(false);
            }
            if filter.contains(key, value) {
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryPool, MemoryPoolSettings};
    use crate::storage::file_structure::FileStructure;
    use crate::tree::builder::SequentialTreeBuilder;
    use crate::tree::encoding::{standard_u64_library, FIXED_SIZE_ENCODING_ID};
    use crate::tree::filters::PointIdBitArray;
    use std::sync::Arc;
    use uuid::Uuid;

    fn build(sources: &[&[(u64, u64)]]) -> (Arc<FileStructure>, Vec<Uuid>) {
        let pool = MemoryPool::new(MemoryPoolSettings {
            page_size: 4096,
            minimum_bytes: 0,
            target_bytes: 16 << 20,
            maximum_bytes: 16 << 20,
        })
        .unwrap();
        let structure = FileStructure::create_memory(pool, 4096).unwrap();
        let library = standard_u64_library();
        let mut edit = structure.begin_edit().unwrap();
        let mut ids = Vec::new();
        for (n, records) in sources.iter().enumerate() {
            let mut builder = SequentialTreeBuilder::create(
                &mut edit,
                &format!("source_{}", n),
                FIXED_SIZE_ENCODING_ID,
                &library,
            )
            .unwrap();
            for &(key, value) in records.iter() {
                builder.append(key, value).unwrap();
            }
            ids.push(builder.finish().unwrap().id);
        }
        edit.commit().unwrap();
        (structure, ids)
    }

    fn scanners(
        structure: &Arc<FileStructure>,
        ids: &[Uuid],
    ) -> Vec<TreeScanner<u64, u64>> {
        let library = standard_u64_library();
        let snapshot = Arc::new(structure.acquire_read_snapshot());
        ids.iter()
            .map(|&id| TreeScanner::open(&snapshot, id, &library).unwrap())
            .collect()
    }

    #[test]
    fn test_interleaved_sources_merge_sorted() {
        let (structure, ids) = build(&[
            &[(1, 100), (4, 400), (7, 700)],
            &[(2, 200), (5, 500)],
            &[(3, 300), (6, 600)],
        ]);
        let mut merged = UnionTreeStream::new(scanners(&structure, &ids)).unwrap();
        let (mut key, mut value) = (0u64, 0u64);
        let mut seen = Vec::new();
        while merged.read(&mut key, &mut value).unwrap() {
            seen.push((key, value));
        }
        assert_eq!(
            seen,
            vec![
                (1, 100),
                (2, 200),
                (3, 300),
                (4, 400),
                (5, 500),
                (6, 600),
                (7, 700)
            ]
        );
    }

    #[test]
    fn test_equal_keys_break_toward_earlier_source() {
        let (structure, ids) = build(&[&[(5, 1), (9, 1)], &[(5, 2)], &[(5, 3), (6, 3)]]);
        let mut merged = UnionTreeStream::new(scanners(&structure, &ids)).unwrap();
        let (mut key, mut value) = (0u64, 0u64);
        let mut seen = Vec::new();
        while merged.read(&mut key, &mut value).unwrap() {
            seen.push((key, value));
        }
        assert_eq!(seen, vec![(5, 1), (5, 2), (5, 3), (6, 3), (9, 1)]);
    }

    #[test]
    fn test_match_filter_applies_post_merge() {
        let (structure, ids) = build(&[&[(1, 1), (3, 3)], &[(2, 2), (4, 4)]]);
        let filter = PointIdBitArray::new([2u64, 3], 4);
        let mut merged = UnionTreeStream::new(scanners(&structure, &ids)).unwrap();
        let (mut key, mut value) = (0u64, 0u64);
        let mut seen = Vec::new();
        while merged.read_and_filter(&filter, &mut key, &mut value).unwrap() {
            seen.push(key);
        }
        assert_eq!(seen, vec![2, 3]);
    }

    #[test]
    fn test_seek_filter_windows_across_sources() {
        let sources: Vec<Vec<(u64, u64)>> = (0..3)
            .map(|n| (0..100u64).map(|i| (i * 3 + n, i)).collect())
            .collect();
        let refs: Vec<&[(u64, u64)]> = sources.iter().map(|s| s.as_slice()).collect();
        let (structure, ids) = build(&refs);

        let mut merged = UnionTreeStream::with_seek_filter(scanners(&structure, &ids), || {
            Box::new(crate::tree::filters::KeyRangeSeekFilter::new(vec![
                (10u64, 20),
                (50, 60),
            ]))
        })
        .unwrap();
        let (mut key, mut value) = (0u64, 0u64);
        let mut seen = Vec::new();
        while merged.read(&mut key, &mut value).unwrap() {
            seen.push(key);
        }
        let expected: Vec<u64> = (10..20).chain(50..60).collect();
        assert_eq!(seen, expected);
    }
}
