use crate::collections::ResourceQueue;
use crate::error::{Result, SnapError};
use crate::storage::file_structure::TransactionalEdit;
use crate::storage::sub_file::{load_block_table, write_block_table, SubFileIo};
use crate::storage::{SubFileHeader, NIL_BLOCK, TRAILER_SIZE};
use crate::tree::encoding::{EncodingLibrary, FixedKey, FixedValue, PairEncoding};
use crate::tree::node::{internal, NodeHeader};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

// Encode scratch buffers churn on every leaf rewrite; a small pool keeps
// their allocations alive across inserts.
fn scratch_pool() -> ResourceQueue<Vec<u8>> {
    ResourceQueue::new(4, Vec::new)
}

/// Random-insert writer over one sub-file's sorted tree.
///
/// All tree-internal pointers (children, siblings, the root) are virtual
/// block indices resolved through the sub-file's block table. Shadow
/// paging happens underneath: the first touch of a node in a transaction
/// copies it to a freshly allocated physical block and remaps its table
/// entry, so committed readers keep their view while every virtual
/// reference stays valid. The rewritten table is persisted at `finish`.
pub struct TreeWriter<'e, K: FixedKey, V: FixedValue> {
    edit: &'e mut TransactionalEdit,
    io: SubFileIo,
    encoding: Arc<dyn PairEncoding<K, V>>,
    sub: SubFileHeader,
    /// Virtual index -> physical block, mutated in place during the
    /// transaction.
    table: Vec<u32>,
    /// Physical blocks occupied by the persisted table, freed when the
    /// table is rewritten.
    old_table_blocks: Vec<u32>,
    /// Virtual indices already shadow-copied in this transaction.
    shadowed: HashSet<u32>,
    scratch: ResourceQueue<Vec<u8>>,
    dirty: bool,
    finished: bool,
}

impl<'e, K: FixedKey, V: FixedValue> TreeWriter<'e, K, V> {
    /// Creates a new sub-file holding an empty tree: a single leaf root,
    /// height 1.
    pub fn create(
        edit: &'e mut TransactionalEdit,
        name: &str,
        encoding_id: Uuid,
        library: &EncodingLibrary<K, V>,
    ) -> Result<Self> {
        let encoding = library.resolve(encoding_id)?;
        let id = edit.create_sub_file(name, K::type_id(), V::type_id(), encoding_id)?;
        let mut io = SubFileIo::open(edit)?;

        let physical = edit.allocate_block()?;
        let header = NodeHeader::<K>::new(0);
        io.source_data().write(physical, |body| header.write_to(body))?;

        let mut sub = edit.sub_file(id)?.clone();
        sub.root_block = 0;
        sub.tree_height = 1;

        let mut shadowed = HashSet::new();
        shadowed.insert(0);
        Ok(Self {
            edit,
            io,
            encoding,
            sub,
            table: vec![physical],
            old_table_blocks: Vec::new(),
            shadowed,
            scratch: scratch_pool(),
            dirty: true,
            finished: false,
        })
    }

    /// Opens an existing sub-file for writing within the transaction.
    pub fn open(
        edit: &'e mut TransactionalEdit,
        id: Uuid,
        library: &EncodingLibrary<K, V>,
    ) -> Result<Self> {
        let sub = edit.sub_file(id)?.clone();
        if sub.key_type != K::type_id() || sub.value_type != V::type_id() {
            return Err(SnapError::SubFileMismatch(format!(
                "sub-file {} holds a different pair type",
                sub.name
            )));
        }
        let encoding = library.resolve(sub.encoding)?;
        let mut io = SubFileIo::open(edit)?;
        let (table, old_table_blocks) = load_block_table(io.source_index(), sub.table_root)?;
        Ok(Self {
            edit,
            io,
            encoding,
            sub,
            table,
            old_table_blocks,
            shadowed: HashSet::new(),
            scratch: scratch_pool(),
            dirty: false,
            finished: false,
        })
    }

    pub fn sub_file_id(&self) -> Uuid {
        self.sub.id
    }

    pub fn record_count(&self) -> u64 {
        self.sub.record_count
    }

    fn body_len(&self) -> usize {
        self.edit.block_size() as usize - TRAILER_SIZE
    }

    fn physical(&self, virtual_index: u32) -> Result<u32> {
        self.table
            .get(virtual_index as usize)
            .copied()
            .ok_or(SnapError::IndexMismatch {
                requested: virtual_index,
                limit: self.table.len() as u32,
            })
    }

    /// Inserts one pair. An existing equal key is rejected.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        // Descend to the target leaf, collecting the path for separator
        // inserts on split. Bounds widen on the way down.
        let mut path: Vec<(u32, usize)> = Vec::new();
        let mut current = self.sub.root_block;
        let mut level = self.sub.tree_height - 1;
        while level > 0 {
            let (child_idx, child) = self.descend_once(current, level, &key)?;
            path.push((current, child_idx));
            current = child;
            level -= 1;
        }

        self.insert_in_leaf(current, key, value, &mut path)?;
        self.sub.record_count += 1;
        Ok(())
    }

    /// Persists the rewritten block table and publishes the updated
    /// sub-file directory entry into the edit. Must be called before
    /// commit for the tree changes to become visible.
    pub fn finish(mut self) -> Result<SubFileHeader> {
        if self.dirty {
            for block in std::mem::take(&mut self.old_table_blocks) {
                self.edit.free_block(block)?;
            }
            let (table_root, _) = write_block_table(self.edit, &self.table)?;
            self.sub.table_root = table_root;
            self.sub.last_modified_snapshot = self.edit.target_snapshot_seq();
            self.edit.update_sub_file(self.sub.clone())?;
        }
        self.finished = true;
        Ok(self.sub.clone())
    }

    /// Ensures a node is backed by a block allocated in this transaction,
    /// copying it and remapping its table entry on first touch.
    fn shadow(&mut self, virtual_index: u32, is_leaf: bool) -> Result<u32> {
        let physical = self.physical(virtual_index)?;
        if self.shadowed.contains(&virtual_index) {
            return Ok(physical);
        }
        let image = {
            let session = if is_leaf {
                self.io.source_data()
            } else {
                self.io.source_index()
            };
            session.read(physical)?.to_vec()
        };
        let new_physical = self.edit.allocate_block()?;
        {
            let session = if is_leaf {
                self.io.destination_data()
            } else {
                self.io.destination_index()
            };
            session.write_body(new_physical, &image)?;
        }
        if is_leaf {
            self.io.swap_data();
        } else {
            self.io.swap_index();
        }
        self.edit.free_block(physical)?;
        self.table[virtual_index as usize] = new_physical;
        self.shadowed.insert(virtual_index);
        self.dirty = true;
        Ok(new_physical)
    }

    /// Registers a brand-new node image under a fresh virtual index.
    fn allocate_node(&mut self) -> Result<u32> {
        let physical = self.edit.allocate_block()?;
        let virtual_index = self.table.len() as u32;
        self.table.push(physical);
        self.shadowed.insert(virtual_index);
        self.dirty = true;
        Ok(virtual_index)
    }

    /// One internal-node step of the descent: widens bounds to cover
    /// `key` and picks the covering child.
    fn descend_once(&mut self, current: u32, level: u8, key: &K) -> Result<(usize, u32)> {
        let physical = self.shadow(current, false)?;
        let mut image = self.io.source_index().read(physical)?.to_vec();
        let mut header = NodeHeader::<K>::read_from(&image)?;
        header.expect_level(level)?;

        let mut bounds_dirty = false;
        if *key < header.lower_bound {
            header.lower_bound = key.clone();
            bounds_dirty = true;
        }
        if *key > header.upper_bound {
            header.upper_bound = key.clone();
            bounds_dirty = true;
        }
        if bounds_dirty {
            header.write_to(&mut image);
            self.io.source_index().write_body(physical, &image)?;
        }

        let idx = internal::search::<K>(&image, header.record_count, key);
        let (_, child) = internal::read_entry::<K>(&image, idx);
        Ok((idx, child))
    }

    fn decode_leaf(&self, image: &[u8], header: &NodeHeader<K>) -> Result<Vec<(K, V)>> {
        let mut records = Vec::with_capacity(header.record_count as usize);
        let mut prev_key = K::default();
        let mut prev_value = V::default();
        let mut pos = header.records_start();
        for _ in 0..header.record_count {
            let mut key = K::default();
            let mut value = V::default();
            let (consumed, _) = self.encoding.decode(
                &image[pos..header.records_end()],
                &prev_key,
                &prev_value,
                &mut key,
                &mut value,
            )?;
            pos += consumed;
            prev_key = key.clone();
            prev_value = value.clone();
            records.push((key, value));
        }
        Ok(records)
    }

    fn encode_records(&self, records: &[(K, V)], out: &mut Vec<u8>) {
        out.clear();
        let mut prev_key = K::default();
        let mut prev_value = V::default();
        for (key, value) in records {
            self.encoding.encode(out, &prev_key, &prev_value, key, value);
            prev_key = key.clone();
            prev_value = value.clone();
        }
    }

    fn write_leaf(
        &mut self,
        virtual_index: u32,
        header: &mut NodeHeader<K>,
        records: &[(K, V)],
    ) -> Result<()> {
        let mut encoded = self.scratch.acquire();
        self.encode_records(records, &mut encoded);
        header.record_count = records.len() as u16;
        header.valid_bytes = (NodeHeader::<K>::size() + encoded.len()) as u16;

        let physical = self.physical(virtual_index)?;
        let start = header.records_start();
        let result = self.io.source_data().write(physical, |body| {
            header.write_to(body);
            body[start..start + encoded.len()].copy_from_slice(&encoded);
        });
        self.scratch.release(encoded);
        result
    }

    fn write_internal(
        &mut self,
        virtual_index: u32,
        header: &mut NodeHeader<K>,
        entries: &[(K, u32)],
    ) -> Result<()> {
        header.record_count = entries.len() as u16;
        header.valid_bytes =
            (NodeHeader::<K>::size() + entries.len() * internal::entry_size::<K>()) as u16;

        let physical = self.physical(virtual_index)?;
        let header = header.clone();
        let entries = entries.to_vec();
        self.io.source_index().write(physical, move |body| {
            header.write_to(body);
            for (i, (key, child)) in entries.iter().enumerate() {
                internal::write_entry::<K>(body, i, key, *child);
            }
        })
    }

    fn insert_in_leaf(
        &mut self,
        leaf: u32,
        key: K,
        value: V,
        path: &mut Vec<(u32, usize)>,
    ) -> Result<()> {
        let physical = self.shadow(leaf, true)?;
        let (mut header, mut records) = {
            let image = self.io.source_data().read(physical)?.to_vec();
            let header = NodeHeader::<K>::read_from(&image)?;
            header.expect_level(0)?;
            let records = self.decode_leaf(&image, &header)?;
            (header, records)
        };

        let pos = match records.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(_) => return Err(SnapError::DuplicateKey),
            Err(pos) => pos,
        };
        records.insert(pos, (key.clone(), value));

        if key < header.lower_bound {
            header.lower_bound = key.clone();
        }
        if key > header.upper_bound {
            header.upper_bound = key;
        }

        let mut encoded = self.scratch.acquire();
        self.encode_records(&records, &mut encoded);
        let fits = NodeHeader::<K>::size() + encoded.len() <= self.body_len();
        if fits {
            header.record_count = records.len() as u16;
            header.valid_bytes = (NodeHeader::<K>::size() + encoded.len()) as u16;
            let start = header.records_start();
            let result = self.io.source_data().write(physical, |body| {
                header.write_to(body);
                body[start..start + encoded.len()].copy_from_slice(&encoded);
            });
            self.scratch.release(encoded);
            return result;
        }
        self.scratch.release(encoded);

        self.split_leaf(leaf, header, records, path)
    }

    fn split_leaf(
        &mut self,
        leaf: u32,
        old_header: NodeHeader<K>,
        records: Vec<(K, V)>,
        path: &mut Vec<(u32, usize)>,
    ) -> Result<()> {
        let mid = records.len() / 2;
        let right = self.allocate_node()?;
        let old_right = old_header.right_sibling;

        let (left_records, right_records) = records.split_at(mid);
        let separator = right_records[0].0.clone();

        let mut right_header = NodeHeader::<K>::new(0);
        right_header.left_sibling = leaf;
        right_header.right_sibling = old_right;
        right_header.lower_bound = separator.clone();
        right_header.upper_bound = old_header.upper_bound.clone();

        let mut left_header = old_header;
        left_header.right_sibling = right;
        left_header.upper_bound = left_records.last().expect("left half non-empty").0.clone();

        self.write_leaf(leaf, &mut left_header, left_records)?;
        self.write_leaf(right, &mut right_header, right_records)?;

        // The split node's old right neighbor now has a new left sibling;
        // virtual addressing makes this a self-contained touch.
        if old_right != NIL_BLOCK {
            self.fix_left_pointer(old_right, 0, right)?;
        }

        debug!(left = leaf, right, "leaf split");
        self.insert_separator(separator, right, path)
    }

    /// Inserts `(separator, child)` into the parent at the top of `path`,
    /// splitting upward as needed. An empty path means the split node was
    /// the root: the tree grows by one level.
    fn insert_separator(
        &mut self,
        separator: K,
        child: u32,
        path: &mut Vec<(u32, usize)>,
    ) -> Result<()> {
        let (parent, entry_idx) = match path.pop() {
            Some(top) => top,
            None => return self.grow_root(separator, child),
        };

        let physical = self.physical(parent)?;
        let mut image = self.io.source_index().read(physical)?.to_vec();
        let mut header = NodeHeader::<K>::read_from(&image)?;

        if (header.record_count as usize) < internal::capacity::<K>(self.body_len()) {
            internal::insert_entry::<K>(
                &mut image,
                header.record_count,
                entry_idx + 1,
                &separator,
                child,
            );
            header.record_count += 1;
            header.valid_bytes = (NodeHeader::<K>::size()
                + header.record_count as usize * internal::entry_size::<K>())
                as u16;
            header.write_to(&mut image);
            return self.io.source_index().write_body(physical, &image);
        }

        self.split_internal(parent, header, image, entry_idx, separator, child, path)
    }

    #[allow(clippy::too_many_arguments)]
    fn split_internal(
        &mut self,
        node: u32,
        old_header: NodeHeader<K>,
        image: Vec<u8>,
        entry_idx: usize,
        separator: K,
        child: u32,
        path: &mut Vec<(u32, usize)>,
    ) -> Result<()> {
        let mut entries: Vec<(K, u32)> = (0..old_header.record_count as usize)
            .map(|i| internal::read_entry::<K>(&image, i))
            .collect();
        entries.insert(entry_idx + 1, (separator, child));

        let mid = entries.len() / 2;
        let right = self.allocate_node()?;
        let old_right = old_header.right_sibling;
        let old_upper = old_header.upper_bound.clone();
        let level = old_header.level;

        let (left_entries, right_entries) = entries.split_at(mid);
        let bubble = right_entries[0].0.clone();

        let mut left_header = old_header;
        left_header.right_sibling = right;
        left_header.upper_bound = left_entries.last().expect("left half non-empty").0.clone();
        self.write_internal(node, &mut left_header, left_entries)?;

        let mut right_header = NodeHeader::<K>::new(level);
        right_header.left_sibling = node;
        right_header.right_sibling = old_right;
        right_header.lower_bound = bubble.clone();
        right_header.upper_bound = old_upper;
        self.write_internal(right, &mut right_header, right_entries)?;

        if old_right != NIL_BLOCK {
            self.fix_left_pointer(old_right, level, right)?;
        }

        debug!(left = node, right, level, "internal split");
        self.insert_separator(bubble, right, path)
    }

    /// Root split: a new internal root adopts the old root and the new
    /// right node, growing the height by one.
    fn grow_root(&mut self, separator: K, right_child: u32) -> Result<()> {
        let new_root = self.allocate_node()?;
        let level = self.sub.tree_height;

        let mut header = NodeHeader::<K>::new(level);
        let entries = vec![
            (K::lower_limit(), self.sub.root_block),
            (separator, right_child),
        ];
        self.write_internal(new_root, &mut header, &entries)?;

        self.sub.root_block = new_root;
        self.sub.tree_height += 1;
        debug!(root = new_root, height = self.sub.tree_height, "tree grew");
        Ok(())
    }

    /// Repairs the left-sibling pointer of the node right of a split.
    fn fix_left_pointer(&mut self, node: u32, level: u8, new_left: u32) -> Result<()> {
        let is_leaf = level == 0;
        let physical = self.shadow(node, is_leaf)?;
        let session = if is_leaf {
            self.io.source_data()
        } else {
            self.io.source_index()
        };
        let mut image = session.read(physical)?.to_vec();
        let mut header = NodeHeader::<K>::read_from(&image)?;
        header.left_sibling = new_left;
        header.write_to(&mut image);
        session.write_body(physical, &image)
    }
}

impl<K: FixedKey, V: FixedValue> Drop for TreeWriter<'_, K, V> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                sub_file = %self.sub.name,
                "tree writer dropped without finish; directory entry not updated"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryPool, MemoryPoolSettings};
    use crate::storage::file_structure::FileStructure;
    use crate::tree::encoding::{standard_u64_library, FIXED_SIZE_ENCODING_ID};
    use crate::tree::scanner::TreeScanner;

    fn test_structure() -> Arc<FileStructure> {
        let pool = MemoryPool::new(MemoryPoolSettings {
            page_size: 4096,
            minimum_bytes: 0,
            target_bytes: 16 << 20,
            maximum_bytes: 16 << 20,
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
    fn test_single_leaf_accepts_until_split() {
        let structure = test_structure();
        let library = standard_u64_library();

        // Fixed-size u64 pairs: 16 bytes each, so one 4096 block holds
        // (4080 - 30) / 16 = 253 records before the first split.
        let mut edit = structure.begin_edit().unwrap();
        let mut writer =
            TreeWriter::<u64, u64>::create(&mut edit, "points", FIXED_SIZE_ENCODING_ID, &library)
                .unwrap();
        for i in 0..253u64 {
            writer.insert(i, i).unwrap();
        }
        let sub = writer.finish().unwrap();
        assert_eq!(sub.tree_height, 1);
        let id = sub.id;
        edit.commit().unwrap();

        // The next insert splits the root leaf and grows the tree.
        let mut edit = structure.begin_edit().unwrap();
        let mut writer = TreeWriter::<u64, u64>::open(&mut edit, id, &library).unwrap();
        writer.insert(253, 253).unwrap();
        let sub = writer.finish().unwrap();
        assert_eq!(sub.tree_height, 2);
        edit.commit().unwrap();

        let records = scan_all(&structure, id);
        assert_eq!(records.len(), 254);
        assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let structure = test_structure();
        let library = standard_u64_library();
        let mut edit = structure.begin_edit().unwrap();
        let mut writer =
            TreeWriter::<u64, u64>::create(&mut edit, "points", FIXED_SIZE_ENCODING_ID, &library)
                .unwrap();
        writer.insert(7, 1).unwrap();
        assert!(matches!(writer.insert(7, 2), Err(SnapError::DuplicateKey)));
        writer.finish().unwrap();
        edit.rollback();
    }

    #[test]
    fn test_reverse_insertion_order() {
        let structure = test_structure();
        let library = standard_u64_library();
        let mut edit = structure.begin_edit().unwrap();
        let id = {
            let mut writer = TreeWriter::<u64, u64>::create(
                &mut edit,
                "points",
                FIXED_SIZE_ENCODING_ID,
                &library,
            )
            .unwrap();
            for i in (0..2000u64).rev() {
                writer.insert(i, i * 10).unwrap();
            }
            writer.finish().unwrap().id
        };
        edit.commit().unwrap();

        let records = scan_all(&structure, id);
        assert_eq!(records.len(), 2000);
        for (i, (key, value)) in records.iter().enumerate() {
            assert_eq!(*key, i as u64);
            assert_eq!(*value, i as u64 * 10);
        }
    }

    #[test]
    fn test_cow_leaves_old_snapshot_intact() {
        let structure = test_structure();
        let library = standard_u64_library();

        let mut edit = structure.begin_edit().unwrap();
        let id = {
            let mut writer = TreeWriter::<u64, u64>::create(
                &mut edit,
                "points",
                FIXED_SIZE_ENCODING_ID,
                &library,
            )
            .unwrap();
            for i in 0..500u64 {
                writer.insert(i * 2, i).unwrap();
            }
            writer.finish().unwrap().id
        };
        edit.commit().unwrap();

        // Pin a snapshot, then mutate heavily and commit.
        let snapshot = Arc::new(structure.acquire_read_snapshot());
        let mut edit = structure.begin_edit().unwrap();
        {
            let mut writer = TreeWriter::<u64, u64>::open(&mut edit, id, &library).unwrap();
            for i in 0..500u64 {
                writer.insert(i * 2 + 1, i).unwrap();
            }
            writer.finish().unwrap();
        }
        edit.commit().unwrap();

        // The old snapshot still sees exactly the original records.
        let mut scanner = TreeScanner::open(&snapshot, id, &library).unwrap();
        let (mut key, mut value) = (0u64, 0u64);
        let mut count = 0;
        while scanner.read(&mut key, &mut value).unwrap() {
            assert_eq!(key % 2, 0);
            count += 1;
        }
        assert_eq!(count, 500);

        // A fresh snapshot sees both generations.
        assert_eq!(scan_all(&structure, id).len(), 1000);
    }
}
