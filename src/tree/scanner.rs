use crate::error::{Result, SnapError};
use crate::storage::file_structure::ReadSnapshot;
use crate::storage::sub_file::{BlockTableReader, SubFileReadIo};
use crate::storage::NIL_BLOCK;
use crate::tree::encoding::{EncodingLibrary, FixedKey, FixedValue, PairEncoding};
use crate::tree::filters::MatchFilter;
use crate::tree::node::{internal, NodeHeader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Sequential reader over one sub-file's sorted tree.
///
/// A scanner is an explicit cursor: it owns its two I/O sessions (one
/// pinning the current leaf, one resolving internal nodes and the block
/// table), keeps a copy of the current leaf, and advances record by
/// record through the pair encoding. Scanners are single-session and not
/// clonable; the read snapshot they pin stays alive for as long as they
/// do.
pub struct TreeScanner<K: FixedKey, V: FixedValue> {
    io: SubFileReadIo,
    encoding: Arc<dyn PairEncoding<K, V>>,
    resolver: BlockTableReader,
    root_block: u32,
    height: u8,
    _pin: Option<Arc<ReadSnapshot>>,

    // Current leaf decode state.
    leaf: Vec<u8>,
    record_count: u16,
    index_in_node: u16,
    pos: usize,
    valid_end: usize,
    node_upper: K,
    node_right: u32,
    prev_key: K,
    prev_value: V,

    pending: Option<(K, V)>,
    last_emitted: Option<K>,
    at_end: bool,
    positioned: bool,

    cancel: Arc<AtomicBool>,
    chain_retries: u64,
    reseeks: u64,
}

impl<K: FixedKey, V: FixedValue> TreeScanner<K, V> {
    /// Opens a scanner over a sub-file pinned by `snapshot`.
    pub fn open(
        snapshot: &Arc<ReadSnapshot>,
        id: Uuid,
        library: &EncodingLibrary<K, V>,
    ) -> Result<Self> {
        let sub = snapshot.sub_file(id)?.clone();
        snapshot.check_visible(&sub)?;
        if sub.key_type != K::type_id() || sub.value_type != V::type_id() {
            return Err(SnapError::SubFileMismatch(format!(
                "sub-file {} holds a different pair type",
                sub.name
            )));
        }
        let encoding = library.resolve(sub.encoding)?;
        let mut io = SubFileReadIo::open(snapshot)?;
        let resolver = BlockTableReader::open(io.index(), sub.table_root)?;
        Ok(Self::from_parts(
            io,
            encoding,
            resolver,
            sub.root_block,
            sub.tree_height,
            Some(Arc::clone(snapshot)),
        ))
    }

    pub fn open_by_name(
        snapshot: &Arc<ReadSnapshot>,
        name: &str,
        library: &EncodingLibrary<K, V>,
    ) -> Result<Self> {
        let id = snapshot.sub_file_by_name(name)?.id;
        Self::open(snapshot, id, library)
    }

    /// Builds a scanner from raw parts; used internally to scan staged,
    /// uncommitted trees during bulk sorting.
    pub(crate) fn from_parts(
        io: SubFileReadIo,
        encoding: Arc<dyn PairEncoding<K, V>>,
        resolver: BlockTableReader,
        root_block: u32,
        height: u8,
        pin: Option<Arc<ReadSnapshot>>,
    ) -> Self {
        Self {
            io,
            encoding,
            resolver,
            root_block,
            height,
            _pin: pin,
            leaf: Vec::new(),
            record_count: 0,
            index_in_node: 0,
            pos: 0,
            valid_end: 0,
            node_upper: K::upper_limit(),
            node_right: NIL_BLOCK,
            prev_key: K::default(),
            prev_value: V::default(),
            pending: None,
            last_emitted: None,
            at_end: false,
            positioned: false,
            cancel: Arc::new(AtomicBool::new(false)),
            chain_retries: 0,
            reseeks: 0,
        }
    }

    /// Cooperative cancellation flag; setting it makes the next read fail
    /// with `Canceled`.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Sibling-chain retries observed; forwarded as telemetry rather than
    /// looped over silently.
    pub fn chain_retries(&self) -> u64 {
        self.chain_retries
    }

    pub fn reseeks(&self) -> u64 {
        self.reseeks
    }

    /// Positions before the first record.
    pub fn seek_to_start(&mut self) -> Result<()> {
        let mut current = self.root_block;
        for level in (1..self.height).rev() {
            let physical = self.resolver.resolve(self.io.index(), current)?;
            let body = self.io.index().read(physical)?;
            let header = NodeHeader::<K>::read_from(body)?;
            header.expect_level(level)?;
            let (_, child) = internal::read_entry::<K>(body, 0);
            current = child;
        }
        self.load_leaf(current)?;
        self.pending = None;
        self.last_emitted = None;
        self.at_end = false;
        self.positioned = true;
        Ok(())
    }

    /// Positions at the first record with key `>= key`.
    pub fn seek(&mut self, key: &K) -> Result<()> {
        self.seek_inner(key)?;
        self.last_emitted = None;
        Ok(())
    }

    fn seek_inner(&mut self, key: &K) -> Result<()> {
        let mut current = self.root_block;
        for level in (1..self.height).rev() {
            let physical = self.resolver.resolve(self.io.index(), current)?;
            let body = self.io.index().read(physical)?;
            let header = NodeHeader::<K>::read_from(body)?;
            header.expect_level(level)?;
            let idx = internal::search::<K>(body, header.record_count, key);
            let (_, child) = internal::read_entry::<K>(body, idx);
            current = child;
        }

        self.load_leaf(current)?;
        // A split published after the parent was read can leave the key to
        // the right of the located leaf; walk the chain forward.
        while *key > self.node_upper && self.node_right != NIL_BLOCK {
            let next = self.node_right;
            self.load_leaf(next)?;
        }

        self.pending = None;
        self.at_end = false;
        self.positioned = true;

        // Skip records below the key.
        loop {
            match self.decode_next()? {
                Some((k, v)) => {
                    if k >= *key {
                        self.pending = Some((k, v));
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    /// Reads the next record. Returns false at the end of the sub-file.
    pub fn read(&mut self, key: &mut K, value: &mut V) -> Result<bool> {
        self.next_record(true, key, value)
    }

    /// Looks at the next record without consuming it.
    pub fn peek(&mut self, key: &mut K, value: &mut V) -> Result<bool> {
        self.next_record(false, key, value)
    }

    /// Reads the next record only while its key is strictly below
    /// `upper_bound`.
    pub fn read_while(&mut self, upper_bound: &K, key: &mut K, value: &mut V) -> Result<bool> {
        if !self.next_record(false, key, value)? {
            return Ok(false);
        }
        if *key >= *upper_bound {
            return Ok(false);
        }
        self.consume_pending();
        Ok(true)
    }

    /// `read_while` with a per-record match predicate.
    pub fn read_while_and_filter(
        &mut self,
        upper_bound: &K,
        filter: &dyn MatchFilter<K, V>,
        key: &mut K,
        value: &mut V,
    ) -> Result<bool> {
        loop {
            if !self.next_record(false, key, value)? {
                return Ok(false);
            }
            if *key >= *upper_bound {
                return Ok(false);
            }
            self.consume_pending();
            if filter.contains(key, value) {
                return Ok(true);
            }
        }
    }

    fn next_record(&mut self, consume: bool, key: &mut K, value: &mut V) -> Result<bool> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(SnapError::Canceled);
        }
        if self.at_end {
            return Ok(false);
        }
        if !self.positioned {
            self.seek_to_start()?;
        }

        if self.pending.is_none() {
            loop {
                if let Some(record) = self.decode_next()? {
                    self.pending = Some(record);
                    break;
                }
                if !self.advance_chain()? {
                    return Ok(false);
                }
            }
        }

        let (k, v) = self.pending.as_ref().expect("pending record");
        *key = k.clone();
        *value = v.clone();
        if consume {
            self.consume_pending();
        }
        Ok(true)
    }

    fn consume_pending(&mut self) {
        if let Some((k, _)) = self.pending.take() {
            self.last_emitted = Some(k);
        }
    }

    fn decode_next(&mut self) -> Result<Option<(K, V)>> {
        if self.index_in_node >= self.record_count {
            return Ok(None);
        }
        let mut key = K::default();
        let mut value = V::default();
        let (consumed, _) = self.encoding.decode(
            &self.leaf[self.pos..self.valid_end],
            &self.prev_key,
            &self.prev_value,
            &mut key,
            &mut value,
        )?;
        self.pos += consumed;
        self.index_in_node += 1;
        self.prev_key = key.clone();
        self.prev_value = value.clone();
        Ok(Some((key, value)))
    }

    /// Moves to the right sibling. A violated lower-bound sequence gets
    /// one extra hop, then one re-seek from root; anything further is an
    /// error.
    fn advance_chain(&mut self) -> Result<bool> {
        if self.node_right == NIL_BLOCK {
            self.at_end = true;
            return Ok(false);
        }
        let prior_upper = self.node_upper.clone();
        let next = self.node_right;
        self.load_leaf(next)?;

        let lower = self.leaf_lower()?;
        if lower > prior_upper {
            return Ok(true);
        }

        // Chain lag: one inserted node is tolerated with a single hop.
        self.chain_retries += 1;
        if self.node_right != NIL_BLOCK {
            let next = self.node_right;
            self.load_leaf(next)?;
            if self.leaf_lower()? > prior_upper {
                return Ok(true);
            }
        }

        // Still inconsistent: one re-seek from root, past what was read.
        self.reseeks += 1;
        if self.reseeks > 1 {
            return Err(SnapError::Storage(
                "sibling chain remains inconsistent after re-seek".to_string(),
            ));
        }
        match self.last_emitted.clone() {
            Some(last) => {
                self.seek_inner(&last)?;
                // The re-seek repositions at `last`; drop the replayed record.
                if let Some((k, _)) = &self.pending {
                    if *k == last {
                        self.pending = None;
                    }
                }
                Ok(true)
            }
            None => {
                self.seek_to_start()?;
                Ok(true)
            }
        }
    }

    fn leaf_lower(&self) -> Result<K> {
        Ok(NodeHeader::<K>::read_from(&self.leaf)?.lower_bound)
    }

    // `block` is a virtual index; the physical location may change across
    // commits, but this scanner's snapshot pins a consistent table.
    fn load_leaf(&mut self, block: u32) -> Result<()> {
        let physical = self.resolver.resolve(self.io.index(), block)?;
        let mut leaf = std::mem::take(&mut self.leaf);
        {
            let body = self.io.data().read(physical)?;
            leaf.clear();
            leaf.extend_from_slice(body);
        }
        let header = NodeHeader::<K>::read_from(&leaf)?;
        header.expect_level(0)?;
        self.leaf = leaf;
        self.record_count = header.record_count;
        self.index_in_node = 0;
        self.pos = header.records_start();
        self.valid_end = header.records_end();
        self.node_upper = header.upper_bound;
        self.node_right = header.right_sibling;
        self.prev_key = K::default();
        self.prev_value = V::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryPool, MemoryPoolSettings};
    use crate::storage::file_structure::FileStructure;
    use crate::tree::builder::SequentialTreeBuilder;
    use crate::tree::encoding::{standard_u64_library, DELTA_U64_ENCODING_ID};
    use crate::tree::filters::ULongHashSet;
    use crate::tree::writer::TreeWriter;

    fn build_tree(records: u64) -> (Arc<FileStructure>, Uuid) {
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
        let id = if records == 0 {
            let writer = TreeWriter::<u64, u64>::create(
                &mut edit,
                "points",
                DELTA_U64_ENCODING_ID,
                &library,
            )
            .unwrap();
            writer.finish().unwrap().id
        } else {
            let mut builder =
                SequentialTreeBuilder::create(&mut edit, "points", DELTA_U64_ENCODING_ID, &library)
                    .unwrap();
            // Keys 10, 20, 30, ... leave gaps for seek tests.
            for i in 1..=records {
                builder.append(i * 10, i).unwrap();
            }
            builder.finish().unwrap().id
        };
        edit.commit().unwrap();
        (structure, id)
    }

    fn open(structure: &Arc<FileStructure>, id: Uuid) -> TreeScanner<u64, u64> {
        let snapshot = Arc::new(structure.acquire_read_snapshot());
        TreeScanner::open(&snapshot, id, &standard_u64_library()).unwrap()
    }

    #[test]
    fn test_empty_tree_reads_false() {
        let (structure, id) = build_tree(0);
        let mut scanner = open(&structure, id);
        let (mut key, mut value) = (0u64, 0u64);
        assert!(!scanner.read(&mut key, &mut value).unwrap());
        scanner.seek(&5).unwrap();
        assert!(!scanner.read(&mut key, &mut value).unwrap());
    }

    #[test]
    fn test_seek_below_all_keys_positions_at_first() {
        let (structure, id) = build_tree(10_000);
        let mut scanner = open(&structure, id);
        scanner.seek(&3).unwrap();
        let (mut key, mut value) = (0u64, 0u64);
        assert!(scanner.read(&mut key, &mut value).unwrap());
        assert_eq!((key, value), (10, 1));
    }

    #[test]
    fn test_seek_between_keys_lands_on_next() {
        let (structure, id) = build_tree(10_000);
        let mut scanner = open(&structure, id);
        scanner.seek(&55_555).unwrap();
        let (mut key, mut value) = (0u64, 0u64);
        assert!(scanner.read(&mut key, &mut value).unwrap());
        assert_eq!(key, 55_560);
    }

    #[test]
    fn test_seek_past_last_reads_false() {
        let (structure, id) = build_tree(1000);
        let mut scanner = open(&structure, id);
        scanner.seek(&10_001).unwrap();
        let (mut key, mut value) = (0u64, 0u64);
        assert!(!scanner.read(&mut key, &mut value).unwrap());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let (structure, id) = build_tree(100);
        let mut scanner = open(&structure, id);
        let (mut key, mut value) = (0u64, 0u64);
        assert!(scanner.peek(&mut key, &mut value).unwrap());
        assert_eq!(key, 10);
        assert!(scanner.peek(&mut key, &mut value).unwrap());
        assert_eq!(key, 10);
        assert!(scanner.read(&mut key, &mut value).unwrap());
        assert_eq!(key, 10);
        assert!(scanner.read(&mut key, &mut value).unwrap());
        assert_eq!(key, 20);
    }

    #[test]
    fn test_read_while_stops_below_bound() {
        let (structure, id) = build_tree(1000);
        let mut scanner = open(&structure, id);
        let (mut key, mut value) = (0u64, 0u64);
        let mut count = 0;
        while scanner.read_while(&105, &mut key, &mut value).unwrap() {
            count += 1;
        }
        // Keys 10..=100.
        assert_eq!(count, 10);
        // The bounding record is still there for a plain read.
        assert!(scanner.read(&mut key, &mut value).unwrap());
        assert_eq!(key, 110);
    }

    #[test]
    fn test_read_while_and_filter() {
        let (structure, id) = build_tree(1000);
        let mut scanner = open(&structure, id);
        let filter = ULongHashSet::new([20u64, 40, 90, 120]);
        let (mut key, mut value) = (0u64, 0u64);
        let mut seen = Vec::new();
        while scanner
            .read_while_and_filter(&100, &filter, &mut key, &mut value)
            .unwrap()
        {
            seen.push(key);
        }
        assert_eq!(seen, vec![20, 40, 90]);
    }

    #[test]
    fn test_cancel_surfaces_promptly() {
        let (structure, id) = build_tree(1000);
        let mut scanner = open(&structure, id);
        let (mut key, mut value) = (0u64, 0u64);
        assert!(scanner.read(&mut key, &mut value).unwrap());

        scanner.cancel_token().store(true, Ordering::Release);
        assert!(matches!(
            scanner.read(&mut key, &mut value),
            Err(SnapError::Canceled)
        ));
        assert_eq!(scanner.chain_retries(), 0);
    }
}
