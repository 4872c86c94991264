use crate::error::{Result, SnapError};
use crate::storage::file_structure::TransactionalEdit;
use crate::storage::sub_file::{write_block_table, BlockTableReader, SubFileIo, SubFileReadIo};
use crate::storage::{SubFileHeader, NIL_BLOCK, TRAILER_SIZE};
use crate::tree::encoding::{EncodingLibrary, FixedKey, FixedValue, PairEncoding};
use crate::tree::merge::UnionTreeStream;
use crate::tree::node::{internal, NodeHeader};
use crate::tree::scanner::TreeScanner;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

struct LeafState<K: FixedKey, V: FixedValue> {
    node: u32,
    left: u32,
    encoded: Vec<u8>,
    count: u16,
    first: Option<K>,
    last: Option<K>,
    prev_key: K,
    prev_value: V,
}

struct LevelState<K: FixedKey> {
    node: u32,
    left: u32,
    entries: Vec<(K, u32)>,
}

/// Bottom-up tree construction from pre-sorted input, one pass, minimum
/// I/O: leaves are packed to the encoding's limit and emitted left to
/// right; separators buffer per level and emit as internal nodes fill.
///
/// Node references are virtual indices into the sub-file block table;
/// virtual slots are reserved ahead (so sibling pointers are known before
/// a node is written) and receive a physical block at flush time.
pub(crate) struct RawTreeBuilder<K: FixedKey, V: FixedValue> {
    io: SubFileIo,
    encoding: Arc<dyn PairEncoding<K, V>>,
    body_len: usize,
    table: Vec<u32>,
    leaf: LeafState<K, V>,
    levels: Vec<LevelState<K>>,
    last_key: Option<K>,
    total: u64,
}

impl<K: FixedKey, V: FixedValue> RawTreeBuilder<K, V> {
    pub(crate) fn new(
        edit: &mut TransactionalEdit,
        encoding: Arc<dyn PairEncoding<K, V>>,
    ) -> Result<Self> {
        let io = SubFileIo::open(edit)?;
        let body_len = edit.block_size() as usize - TRAILER_SIZE;
        let mut table = Vec::new();
        let first_leaf = reserve_virtual(&mut table);
        Ok(Self {
            io,
            encoding,
            body_len,
            table,
            leaf: LeafState {
                node: first_leaf,
                left: NIL_BLOCK,
                encoded: Vec::new(),
                count: 0,
                first: None,
                last: None,
                prev_key: K::default(),
                prev_value: V::default(),
            },
            levels: Vec::new(),
            last_key: None,
            total: 0,
        })
    }

    pub(crate) fn append(
        &mut self,
        edit: &mut TransactionalEdit,
        key: K,
        value: V,
    ) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key == *last {
                return Err(SnapError::DuplicateKey);
            }
            if key < *last {
                return Err(SnapError::Storage(
                    "bulk input must be pre-sorted".to_string(),
                ));
            }
        }

        let reserved = NodeHeader::<K>::size() + self.encoding.max_record_size();
        if self.leaf.count > 0 && reserved + self.leaf.encoded.len() > self.body_len {
            self.flush_leaf(edit, true)?;
        }

        self.encoding.encode(
            &mut self.leaf.encoded,
            &self.leaf.prev_key,
            &self.leaf.prev_value,
            &key,
            &value,
        );
        if self.leaf.first.is_none() {
            self.leaf.first = Some(key.clone());
        }
        self.leaf.last = Some(key.clone());
        self.leaf.prev_key = key.clone();
        self.leaf.prev_value = value;
        self.leaf.count += 1;
        self.last_key = Some(key);
        self.total += 1;
        Ok(())
    }

    /// Closes every level and returns `(root, height, record_count,
    /// table)`.
    pub(crate) fn finish(
        mut self,
        edit: &mut TransactionalEdit,
    ) -> Result<(u32, u8, u64, Vec<u32>)> {
        self.flush_leaf(edit, false)?;

        let mut i = 0;
        loop {
            // A lone buffered entry atop everything else: its child is the
            // root; the reserved virtual slot for this level stays unused.
            if i + 1 == self.levels.len()
                && self.levels[i].left == NIL_BLOCK
                && self.levels[i].entries.len() == 1
            {
                let root = self.levels[i].entries[0].1;
                let height = (i + 1) as u8;
                debug!(root, height, records = self.total, "bulk build complete");
                return Ok((root, height, self.total, self.table));
            }
            self.flush_level(edit, i, false)?;
            i += 1;
        }
    }

    fn flush_leaf(&mut self, edit: &mut TransactionalEdit, has_successor: bool) -> Result<()> {
        let next = if has_successor {
            reserve_virtual(&mut self.table)
        } else {
            NIL_BLOCK
        };

        let mut header = NodeHeader::<K>::new(0);
        header.record_count = self.leaf.count;
        header.valid_bytes = (NodeHeader::<K>::size() + self.leaf.encoded.len()) as u16;
        header.left_sibling = self.leaf.left;
        header.right_sibling = next;
        if let Some(first) = &self.leaf.first {
            header.lower_bound = first.clone();
        }
        if let Some(last) = &self.leaf.last {
            header.upper_bound = last.clone();
        }

        let node = self.leaf.node;
        let physical = edit.allocate_block()?;
        self.table[node as usize] = physical;
        let start = header.records_start();
        let encoded = std::mem::take(&mut self.leaf.encoded);
        self.io.source_data().write(physical, |body| {
            header.write_to(body);
            body[start..start + encoded.len()].copy_from_slice(&encoded);
        })?;

        let separator = self.leaf.first.clone().unwrap_or_else(K::lower_limit);
        self.add_to_level(edit, 0, separator, node)?;

        self.leaf.left = node;
        self.leaf.node = next;
        self.leaf.encoded = encoded;
        self.leaf.encoded.clear();
        self.leaf.count = 0;
        self.leaf.first = None;
        self.leaf.last = None;
        self.leaf.prev_key = K::default();
        self.leaf.prev_value = V::default();
        Ok(())
    }

    fn add_to_level(
        &mut self,
        edit: &mut TransactionalEdit,
        i: usize,
        separator: K,
        child: u32,
    ) -> Result<()> {
        if self.levels.len() == i {
            let node = reserve_virtual(&mut self.table);
            self.levels.push(LevelState {
                node,
                left: NIL_BLOCK,
                entries: Vec::new(),
            });
        }
        if self.levels[i].entries.len() >= internal::capacity::<K>(self.body_len) {
            self.flush_level(edit, i, true)?;
        }
        self.levels[i].entries.push((separator, child));
        Ok(())
    }

    fn flush_level(
        &mut self,
        edit: &mut TransactionalEdit,
        i: usize,
        has_successor: bool,
    ) -> Result<()> {
        let next = if has_successor {
            reserve_virtual(&mut self.table)
        } else {
            NIL_BLOCK
        };
        let node = self.levels[i].node;
        let left = self.levels[i].left;
        let entries = std::mem::take(&mut self.levels[i].entries);

        let mut header = NodeHeader::<K>::new((i + 1) as u8);
        header.record_count = entries.len() as u16;
        header.valid_bytes =
            (NodeHeader::<K>::size() + entries.len() * internal::entry_size::<K>()) as u16;
        header.left_sibling = left;
        header.right_sibling = next;
        header.lower_bound = entries.first().expect("level flush of empty node").0.clone();
        header.upper_bound = entries.last().expect("level flush of empty node").0.clone();

        let physical = edit.allocate_block()?;
        self.table[node as usize] = physical;
        self.io.source_index().write(physical, |body| {
            header.write_to(body);
            for (n, (key, child)) in entries.iter().enumerate() {
                internal::write_entry::<K>(body, n, key, *child);
            }
        })?;

        let separator = entries[0].0.clone();
        self.levels[i].left = node;
        self.levels[i].node = next;
        self.add_to_level(edit, i + 1, separator, node)
    }
}

fn reserve_virtual(table: &mut Vec<u32>) -> u32 {
    let index = table.len() as u32;
    table.push(NIL_BLOCK);
    index
}

/// Public sequential bulk builder: creates a sub-file and fills its tree
/// from a pre-sorted stream in one bottom-up pass.
pub struct SequentialTreeBuilder<'e, K: FixedKey, V: FixedValue> {
    edit: &'e mut TransactionalEdit,
    raw: RawTreeBuilder<K, V>,
    sub_id: Uuid,
}

impl<'e, K: FixedKey, V: FixedValue> SequentialTreeBuilder<'e, K, V> {
    pub fn create(
        edit: &'e mut TransactionalEdit,
        name: &str,
        encoding_id: Uuid,
        library: &EncodingLibrary<K, V>,
    ) -> Result<Self> {
        let encoding = library.resolve(encoding_id)?;
        let sub_id = edit.create_sub_file(name, K::type_id(), V::type_id(), encoding_id)?;
        let raw = RawTreeBuilder::new(edit, encoding)?;
        Ok(Self { edit, raw, sub_id })
    }

    /// Appends the next record; keys must arrive strictly ascending.
    pub fn append(&mut self, key: K, value: V) -> Result<()> {
        self.raw.append(self.edit, key, value)
    }

    pub fn finish(self) -> Result<SubFileHeader> {
        let (root, height, total, table) = self.raw.finish(self.edit)?;
        let (table_root, _) = write_block_table(self.edit, &table)?;
        let mut sub = self.edit.sub_file(self.sub_id)?.clone();
        sub.table_root = table_root;
        sub.root_block = root;
        sub.tree_height = height;
        sub.record_count = total;
        sub.last_modified_snapshot = self.edit.target_snapshot_seq();
        self.edit.update_sub_file(sub.clone())?;
        Ok(sub)
    }
}

struct StagedRun {
    root: u32,
    height: u8,
    table: Vec<u32>,
}

/// Bulk builder for arbitrary-order input: buffers in memory, spills
/// sorted runs to staging trees when the buffer fills, and finishes by
/// merging every run through the sequential path. Staging trees never
/// persist a block table; their blocks go back to the allocator before
/// the transaction commits.
pub struct SortingTreeBuilder<'e, K: FixedKey, V: FixedValue> {
    edit: &'e mut TransactionalEdit,
    encoding: Arc<dyn PairEncoding<K, V>>,
    encoding_id: Uuid,
    name: String,
    buffer: Vec<(K, V)>,
    max_buffered: usize,
    staged: Vec<StagedRun>,
}

impl<'e, K: FixedKey, V: FixedValue> SortingTreeBuilder<'e, K, V> {
    pub fn create(
        edit: &'e mut TransactionalEdit,
        name: &str,
        encoding_id: Uuid,
        library: &EncodingLibrary<K, V>,
        max_buffered: usize,
    ) -> Result<Self> {
        let encoding = library.resolve(encoding_id)?;
        Ok(Self {
            edit,
            encoding,
            encoding_id,
            name: name.to_string(),
            buffer: Vec::new(),
            max_buffered: max_buffered.max(16),
            staged: Vec::new(),
        })
    }

    pub fn append(&mut self, key: K, value: V) -> Result<()> {
        self.buffer.push((key, value));
        if self.buffer.len() >= self.max_buffered {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        self.buffer.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let mut run = RawTreeBuilder::new(self.edit, Arc::clone(&self.encoding))?;
        for (key, value) in self.buffer.drain(..) {
            run.append(self.edit, key, value)?;
        }
        let (root, height, total, table) = run.finish(self.edit)?;
        debug!(root, records = total, "spilled staging run");
        self.staged.push(StagedRun {
            root,
            height,
            table,
        });
        Ok(())
    }

    pub fn finish(mut self) -> Result<SubFileHeader> {
        if self.staged.is_empty() {
            self.buffer.sort_unstable_by(|a, b| a.0.cmp(&b.0));
            let mut builder = SequentialTreeBuilder::create(
                self.edit,
                &self.name,
                self.encoding_id,
                &single_encoding_library(Arc::clone(&self.encoding)),
            )?;
            for (key, value) in std::mem::take(&mut self.buffer) {
                builder.append(key, value)?;
            }
            return builder.finish();
        }

        if !self.buffer.is_empty() {
            self.spill()?;
        }

        // Merge every staged run into the final tree, then return the
        // staging blocks to the allocator.
        let mut scanners = Vec::with_capacity(self.staged.len());
        for run in &self.staged {
            let io = SubFileReadIo::from_sessions(
                self.edit.create_session()?,
                self.edit.create_session()?,
            );
            scanners.push(TreeScanner::from_parts(
                io,
                Arc::clone(&self.encoding),
                BlockTableReader::Memory(run.table.clone()),
                run.root,
                run.height,
                None,
            ));
        }
        let mut merged = UnionTreeStream::new(scanners)?;

        let mut builder = SequentialTreeBuilder::create(
            self.edit,
            &self.name,
            self.encoding_id,
            &single_encoding_library(Arc::clone(&self.encoding)),
        )?;
        let mut key = K::default();
        let mut value = V::default();
        while merged.read(&mut key, &mut value)? {
            builder.append(key.clone(), value.clone())?;
        }
        let sub = builder.finish()?;
        drop(merged);

        for run in std::mem::take(&mut self.staged) {
            for physical in run.table {
                if physical != NIL_BLOCK {
                    self.edit.free_block(physical)?;
                }
            }
        }
        Ok(sub)
    }
}

// The staging paths resolve encodings by instance, not registry; a one-entry
// library bridges to the sequential builder's signature.
fn single_encoding_library<K: FixedKey, V: FixedValue>(
    encoding: Arc<dyn PairEncoding<K, V>>,
) -> EncodingLibrary<K, V> {
    let mut library = EncodingLibrary::new();
    library.register(encoding);
    library
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryPool, MemoryPoolSettings};
    use crate::storage::file_structure::FileStructure;
    use crate::tree::encoding::{standard_u64_library, DELTA_U64_ENCODING_ID, FIXED_SIZE_ENCODING_ID};
    use crate::tree::scanner::TreeScanner;

    fn test_structure() -> Arc<FileStructure> {
        let pool = MemoryPool::new(MemoryPoolSettings {
            page_size: 4096,
            minimum_bytes: 0,
            target_bytes: 32 << 20,
            maximum_bytes: 32 << 20,
        })
        .unwrap();
        FileStructure::create_memory(pool, 4096).unwrap()
    }

    fn scan_all(structure: &Arc<FileStructure>, id: Uuid) -> Vec<(u64, u64)> {
        let library = standard_u64_library();
        let snapshot = Arc::new(structure.acquire_read_snapshot());
        let mut scanner = TreeScanner::open(&snapshot, id, &library).unwrap();
        let (mut key, mut value) = (0u64, 0u64);
        let mut out = Vec::new();
        while scanner.read(&mut key, &mut value).unwrap() {
            out.push((key, value));
        }
        out
    }

    #[test]
    fn test_sequential_build_round_trips() {
        let structure = test_structure();
        let library = standard_u64_library();
        let mut edit = structure.begin_edit().unwrap();
        let sub = {
            let mut builder =
                SequentialTreeBuilder::create(&mut edit, "points", DELTA_U64_ENCODING_ID, &library)
                    .unwrap();
            for i in 0..100_000u64 {
                builder.append(i, i * 2).unwrap();
            }
            builder.finish().unwrap()
        };
        assert!(sub.tree_height >= 2);
        assert_eq!(sub.record_count, 100_000);
        let id = sub.id;
        edit.commit().unwrap();

        let records = scan_all(&structure, id);
        assert_eq!(records.len(), 100_000);
        for (i, (key, value)) in records.iter().enumerate() {
            assert_eq!((*key, *value), (i as u64, i as u64 * 2));
        }
    }

    #[test]
    fn test_sequential_rejects_unsorted_and_duplicate() {
        let structure = test_structure();
        let library = standard_u64_library();
        let mut edit = structure.begin_edit().unwrap();
        let mut builder =
            SequentialTreeBuilder::create(&mut edit, "points", FIXED_SIZE_ENCODING_ID, &library)
                .unwrap();
        builder.append(10, 0).unwrap();
        assert!(matches!(builder.append(10, 1), Err(SnapError::DuplicateKey)));
        assert!(matches!(builder.append(5, 1), Err(SnapError::Storage(_))));
        drop(builder);
        edit.rollback();
    }

    #[test]
    fn test_leaves_meet_fill_threshold_except_last() {
        let structure = test_structure();
        let library = standard_u64_library();
        let mut edit = structure.begin_edit().unwrap();
        let sub = {
            let mut builder =
                SequentialTreeBuilder::create(&mut edit, "points", FIXED_SIZE_ENCODING_ID, &library)
                    .unwrap();
            for i in 0..10_000u64 {
                builder.append(i, i).unwrap();
            }
            builder.finish().unwrap()
        };
        let id = sub.id;
        edit.commit().unwrap();

        // Walk the leaf chain and check the packing target.
        let snapshot = Arc::new(structure.acquire_read_snapshot());
        let mut session = snapshot.create_session().unwrap();
        let sub = snapshot.sub_file(id).unwrap().clone();
        let reader = BlockTableReader::open(&mut session, sub.table_root).unwrap();
        let mut node = sub.root_block;
        for level in (1..sub.tree_height).rev() {
            let physical = reader.resolve(&mut session, node).unwrap();
            let body = session.read(physical).unwrap();
            let header = NodeHeader::<u64>::read_from(body).unwrap();
            header.expect_level(level).unwrap();
            node = internal::read_entry::<u64>(body, 0).1;
        }
        let body_len = 4096 - TRAILER_SIZE;
        let mut leaves = Vec::new();
        loop {
            let physical = reader.resolve(&mut session, node).unwrap();
            let body = session.read(physical).unwrap();
            let header = NodeHeader::<u64>::read_from(body).unwrap();
            leaves.push(header.valid_bytes as usize);
            if header.right_sibling == NIL_BLOCK {
                break;
            }
            node = header.right_sibling;
        }
        assert!(leaves.len() > 1);
        for used in &leaves[..leaves.len() - 1] {
            assert!(*used * 10 >= body_len * 9, "leaf fill below 90%: {}", used);
        }
    }

    #[test]
    fn test_sorting_builder_without_spill() {
        let structure = test_structure();
        let library = standard_u64_library();
        let mut edit = structure.begin_edit().unwrap();
        let id = {
            let mut builder = SortingTreeBuilder::create(
                &mut edit,
                "points",
                FIXED_SIZE_ENCODING_ID,
                &library,
                1_000_000,
            )
            .unwrap();
            for i in (0..1000u64).rev() {
                builder.append(i, i).unwrap();
            }
            builder.finish().unwrap().id
        };
        edit.commit().unwrap();

        let records = scan_all(&structure, id);
        assert_eq!(records.len(), 1000);
        assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_sorting_builder_with_spills() {
        let structure = test_structure();
        let library = standard_u64_library();
        let mut edit = structure.begin_edit().unwrap();
        let id = {
            let mut builder = SortingTreeBuilder::create(
                &mut edit,
                "points",
                DELTA_U64_ENCODING_ID,
                &library,
                256,
            )
            .unwrap();
            // Interleaved runs force several spills.
            for i in 0..4000u64 {
                let key = (i % 8) * 10_000 + i / 8;
                builder.append(key, i).unwrap();
            }
            builder.finish().unwrap().id
        };
        edit.commit().unwrap();

        let records = scan_all(&structure, id);
        assert_eq!(records.len(), 4000);
        assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
    }
}
