use crate::collections::BitArray;
use crate::error::{Result, SnapError};
use crate::memory::MemoryPool;
use crate::storage::checksum::TRAILER_SIZE;
use crate::storage::file_header::{self, FileHeaderBlock, SubFileHeader};
use crate::storage::io_session::DiskIoSession;
use crate::storage::medium::{BufferedFileMedium, DiskMedium, MemoryMedium};
use crate::storage::NIL_BLOCK;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Transaction lifecycle. `PendingCommit` covers the window between the
/// first commit write and the header publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    Editable,
    PendingCommit,
    Committed,
    RolledBack,
}

struct AllocationState {
    /// Committed in-use map: allocated blocks plus frees still parked
    /// under a live snapshot.
    map: BitArray,
    /// Blocks of the persisted bitmap chain referenced by the committed
    /// header.
    bitmap_chain: Vec<u32>,
    /// Overflow sub-file table block, when the table did not fit inline.
    table_block: Option<u32>,
}

struct SnapshotRegistry {
    /// Live snapshot sequence -> reader count.
    live: BTreeMap<u64, usize>,
    /// Blocks freed at a commit sequence, parked until every snapshot
    /// older than that sequence has closed.
    parked: VecDeque<(u64, Vec<u32>)>,
}

impl SnapshotRegistry {
    /// Clears every parked free that no live snapshot can still observe.
    fn drain(&mut self, map: &mut BitArray) {
        let min_live = self.live.keys().next().copied();
        while let Some((freed_at, _)) = self.parked.front() {
            match min_live {
                Some(seq) if seq < *freed_at => break,
                _ => {
                    let (_, blocks) = self.parked.pop_front().unwrap();
                    for block in blocks {
                        map.clear(block as usize);
                    }
                }
            }
        }
    }
}

/// A container file: the transactional allocator over a [`DiskMedium`].
///
/// One editor at a time mutates through shadow-paged blocks; readers pin
/// the last committed header and are unlimited.
pub struct FileStructure {
    medium: Arc<dyn DiskMedium>,
    pool: Arc<MemoryPool>,
    committed: RwLock<Arc<FileHeaderBlock>>,
    allocation: Mutex<AllocationState>,
    snapshots: Mutex<SnapshotRegistry>,
    editor_active: AtomicBool,
}

impl FileStructure {
    /// Creates an ephemeral container on pool-backed memory.
    pub fn create_memory(pool: Arc<MemoryPool>, block_size: u32) -> Result<Arc<Self>> {
        let medium: Arc<dyn DiskMedium> =
            Arc::new(MemoryMedium::new(Arc::clone(&pool), block_size)?);
        Self::initialize(medium, pool)
    }

    /// Creates a container file on disk, truncating any existing file.
    pub fn create_file(
        path: impl AsRef<Path>,
        pool: Arc<MemoryPool>,
        block_size: u32,
    ) -> Result<Arc<Self>> {
        let medium: Arc<dyn DiskMedium> =
            Arc::new(BufferedFileMedium::create(path.as_ref(), block_size)?);
        Self::initialize(medium, pool)
    }

    /// Opens an existing container file. Fails closed: any header damage
    /// rejects the whole open.
    pub fn open_file(
        path: impl AsRef<Path>,
        pool: Arc<MemoryPool>,
        read_only: bool,
    ) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let mut prefix = [0u8; 64];
        {
            use std::io::Read;
            let mut file = std::fs::File::open(path)?;
            file.read_exact(&mut prefix)
                .map_err(|_| SnapError::CorruptHeader("file shorter than a header".to_string()))?;
        }
        let block_size = file_header::peek_block_size(&prefix)?;
        let medium: Arc<dyn DiskMedium> =
            Arc::new(BufferedFileMedium::open(path, block_size, read_only)?);
        Self::load(medium, pool)
    }

    fn initialize(medium: Arc<dyn DiskMedium>, pool: Arc<MemoryPool>) -> Result<Arc<Self>> {
        medium.grow(1)?;
        let header = FileHeaderBlock::new(medium.block_size());
        let mut session = DiskIoSession::new(Arc::clone(&medium), Arc::clone(&pool))?;
        let mut encode_err = None;
        session.write(0, |body| {
            if let Err(e) = header.encode(body) {
                encode_err = Some(e);
            }
        })?;
        if let Some(e) = encode_err {
            return Err(e);
        }
        medium.flush()?;

        let mut map = BitArray::new(1, false);
        map.set(0);
        Ok(Arc::new(Self {
            medium,
            pool,
            committed: RwLock::new(Arc::new(header)),
            allocation: Mutex::new(AllocationState {
                map,
                bitmap_chain: Vec::new(),
                table_block: None,
            }),
            snapshots: Mutex::new(SnapshotRegistry {
                live: BTreeMap::new(),
                parked: VecDeque::new(),
            }),
            editor_active: AtomicBool::new(false),
        }))
    }

    fn load(medium: Arc<dyn DiskMedium>, pool: Arc<MemoryPool>) -> Result<Arc<Self>> {
        let block_size = medium.block_size() as usize;
        let mut session = DiskIoSession::new(Arc::clone(&medium), Arc::clone(&pool))?;

        let (mut header, sub_file_count) = {
            let body = session.read(0).map_err(|e| match e {
                SnapError::ChecksumInvalid { .. } => {
                    SnapError::CorruptHeader("header checksum mismatch".to_string())
                }
                other => other,
            })?;
            let count = file_header::decode_sub_file_count(body);
            (FileHeaderBlock::decode(body)?, count)
        };
        if header.block_size != medium.block_size() {
            return Err(SnapError::CorruptHeader(format!(
                "header block size {} disagrees with medium {}",
                header.block_size,
                medium.block_size()
            )));
        }
        if header.sub_file_table_root != NIL_BLOCK {
            let body = session.read(header.sub_file_table_root)?.to_vec();
            header.decode_table(&body, sub_file_count)?;
        }

        // Rebuild the allocation map from the persisted chain.
        let block_count = medium.block_count() as usize;
        let payload = block_size - TRAILER_SIZE - 4;
        let mut chain = Vec::new();
        let mut map = if header.alloc_bitmap_root == NIL_BLOCK {
            BitArray::new(block_count, false)
        } else {
            let mut bytes = Vec::with_capacity(block_count.div_ceil(8));
            let mut next = header.alloc_bitmap_root;
            while next != NIL_BLOCK {
                chain.push(next);
                let body = session.read(next)?;
                bytes.extend_from_slice(&body[..payload]);
                next = u32::from_le_bytes(body[payload..payload + 4].try_into().unwrap());
                if chain.len() > block_count {
                    return Err(SnapError::CorruptHeader(
                        "allocation bitmap chain cycles".to_string(),
                    ));
                }
            }
            let map = BitArray::from_bytes(&bytes, block_count);
            for &block in &chain {
                if !map.get(block as usize) {
                    return Err(SnapError::CorruptHeader(format!(
                        "bitmap block {} not marked allocated",
                        block
                    )));
                }
            }
            map
        };
        if map.len() < block_count {
            map.grow(block_count);
        }
        map.set(0);
        let table_block =
            (header.sub_file_table_root != NIL_BLOCK).then_some(header.sub_file_table_root);

        debug!(
            snapshot_seq = header.snapshot_seq,
            sub_files = header.sub_files.len(),
            blocks = block_count,
            "container opened"
        );
        Ok(Arc::new(Self {
            medium,
            pool,
            committed: RwLock::new(Arc::new(header)),
            allocation: Mutex::new(AllocationState {
                map,
                bitmap_chain: chain,
                table_block,
            }),
            snapshots: Mutex::new(SnapshotRegistry {
                live: BTreeMap::new(),
                parked: VecDeque::new(),
            }),
            editor_active: AtomicBool::new(false),
        }))
    }

    pub fn block_size(&self) -> u32 {
        self.medium.block_size()
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub(crate) fn medium(&self) -> &Arc<dyn DiskMedium> {
        &self.medium
    }

    /// Sequence of the last committed header.
    pub fn latest_snapshot_seq(&self) -> u64 {
        self.committed.read().snapshot_seq
    }

    /// Begins the single writer transaction. A second concurrent editor is
    /// refused.
    pub fn begin_edit(self: &Arc<Self>) -> Result<TransactionalEdit> {
        if self
            .editor_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SnapError::EditorActive);
        }

        let mut allocation = self.allocation.lock();
        self.snapshots.lock().drain(&mut allocation.map);
        let shadow = allocation.map.clone();
        drop(allocation);

        let committed = self.committed.read().clone();
        Ok(TransactionalEdit {
            structure: Arc::clone(self),
            shadow,
            frees: Vec::new(),
            sub_files: committed.sub_files.clone(),
            flags: committed.flags.clone(),
            state: EditState::Editable,
            mutated: false,
        })
    }

    /// Pins the current committed header for a reader.
    pub fn acquire_read_snapshot(self: &Arc<Self>) -> ReadSnapshot {
        // Lock order matches the commit publish path (snapshots before
        // committed), so registration and header read stay atomic against
        // a concurrent commit.
        let mut snapshots = self.snapshots.lock();
        let header = self.committed.read().clone();
        *snapshots.live.entry(header.snapshot_seq).or_insert(0) += 1;
        ReadSnapshot {
            structure: Arc::clone(self),
            header,
        }
    }

    fn release_snapshot(&self, seq: u64) {
        let mut allocation = self.allocation.lock();
        let mut snapshots = self.snapshots.lock();
        if let Some(count) = snapshots.live.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                snapshots.live.remove(&seq);
            }
        }
        snapshots.drain(&mut allocation.map);
    }
}

/// Read-consistent view pinned to one committed header. The view survives
/// later commits; blocks it references are not reused until it drops.
pub struct ReadSnapshot {
    structure: Arc<FileStructure>,
    header: Arc<FileHeaderBlock>,
}

impl ReadSnapshot {
    pub fn header(&self) -> &FileHeaderBlock {
        &self.header
    }

    pub fn snapshot_seq(&self) -> u64 {
        self.header.snapshot_seq
    }

    pub fn sub_file(&self, id: Uuid) -> Result<&SubFileHeader> {
        self.header
            .sub_file(id)
            .ok_or_else(|| SnapError::SubFileNotFound(id.to_string()))
    }

    pub fn sub_file_by_name(&self, name: &str) -> Result<&SubFileHeader> {
        self.header
            .sub_file_by_name(name)
            .ok_or_else(|| SnapError::SubFileNotFound(name.to_string()))
    }

    /// Guards against reading a sub-file state from the future: a header
    /// modified after this snapshot is invisible to it.
    pub fn check_visible(&self, sub: &SubFileHeader) -> Result<()> {
        if sub.last_modified_snapshot > self.header.snapshot_seq {
            return Err(SnapError::SnapshotNewerThanReader {
                block_snapshot: sub.last_modified_snapshot,
                reader_snapshot: self.header.snapshot_seq,
            });
        }
        Ok(())
    }

    pub fn create_session(&self) -> Result<DiskIoSession> {
        DiskIoSession::new(
            Arc::clone(self.structure.medium()),
            Arc::clone(self.structure.pool()),
        )
    }
}

impl Drop for ReadSnapshot {
    fn drop(&mut self) {
        self.structure.release_snapshot(self.header.snapshot_seq);
    }
}

/// The writer transaction: shadow allocation map, deferred frees, and a
/// working copy of the sub-file directory. Consumed by `commit` or
/// `rollback`; dropping an editable transaction rolls back.
pub struct TransactionalEdit {
    structure: Arc<FileStructure>,
    shadow: BitArray,
    frees: Vec<u32>,
    sub_files: Vec<SubFileHeader>,
    flags: Vec<Uuid>,
    state: EditState,
    mutated: bool,
}

impl TransactionalEdit {
    pub fn state(&self) -> EditState {
        self.state
    }

    pub fn block_size(&self) -> u32 {
        self.structure.block_size()
    }

    /// Sequence the header will carry if this transaction commits with
    /// mutations.
    pub fn target_snapshot_seq(&self) -> u64 {
        self.structure.latest_snapshot_seq() + 1
    }

    pub fn create_session(&self) -> Result<DiskIoSession> {
        DiskIoSession::new(
            Arc::clone(self.structure.medium()),
            Arc::clone(self.structure.pool()),
        )
    }

    /// Claims a free block in the shadow map, extending the container when
    /// the map is exhausted.
    pub fn allocate_block(&mut self) -> Result<u32> {
        self.check_editable()?;
        let bit = match self.shadow.find_first_cleared() {
            Some(bit) => bit,
            None => {
                let old_len = self.shadow.len();
                self.shadow.grow(old_len + 1);
                self.structure.medium().grow(self.shadow.len() as u32)?;
                old_len
            }
        };
        self.shadow.set(bit);
        self.mutated = true;
        Ok(bit as u32)
    }

    /// Marks a block for release. The block stays in use until commit;
    /// under a live older snapshot it stays parked even longer.
    pub fn free_block(&mut self, block: u32) -> Result<()> {
        self.check_editable()?;
        if block == 0 || !self.shadow.get(block as usize) {
            return Err(SnapError::Storage(format!(
                "free of unallocated block {}",
                block
            )));
        }
        self.frees.push(block);
        self.mutated = true;
        Ok(())
    }

    pub fn sub_files(&self) -> &[SubFileHeader] {
        &self.sub_files
    }

    pub fn sub_file(&self, id: Uuid) -> Result<&SubFileHeader> {
        self.sub_files
            .iter()
            .find(|sub| sub.id == id)
            .ok_or_else(|| SnapError::SubFileNotFound(id.to_string()))
    }

    /// Registers a new sub-file. The typed tree layer initializes its root
    /// before commit.
    pub fn create_sub_file(
        &mut self,
        name: &str,
        key_type: Uuid,
        value_type: Uuid,
        encoding: Uuid,
    ) -> Result<Uuid> {
        self.check_editable()?;
        if self.sub_files.iter().any(|sub| sub.name == name) {
            return Err(SnapError::SubFileMismatch(format!(
                "sub-file {:?} already exists",
                name
            )));
        }
        let id = Uuid::new_v4();
        self.sub_files.push(SubFileHeader {
            id,
            name: name.to_string(),
            key_type,
            value_type,
            encoding,
            table_root: NIL_BLOCK,
            root_block: NIL_BLOCK,
            tree_height: 0,
            record_count: 0,
            last_modified_snapshot: 0,
        });
        self.mutated = true;
        Ok(id)
    }

    /// Publishes updated sub-file metadata (root, height, counts) into the
    /// working directory copy.
    pub fn update_sub_file(&mut self, updated: SubFileHeader) -> Result<()> {
        self.check_editable()?;
        let slot = self
            .sub_files
            .iter_mut()
            .find(|sub| sub.id == updated.id)
            .ok_or_else(|| SnapError::SubFileNotFound(updated.id.to_string()))?;
        *slot = updated;
        self.mutated = true;
        Ok(())
    }

    /// Publishes the transaction. A transaction that performed no
    /// mutations leaves the header untouched (same sequence).
    pub fn commit(mut self) -> Result<()> {
        self.check_editable()?;
        if !self.mutated {
            self.state = EditState::Committed;
            return Ok(());
        }
        self.state = EditState::PendingCommit;
        match self.commit_inner() {
            Ok(()) => {
                self.state = EditState::Committed;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "commit failed, rolling back");
                self.state = EditState::RolledBack;
                Err(e)
            }
        }
    }

    /// Discards all shadow state.
    pub fn rollback(mut self) {
        debug!("transaction rolled back");
        self.state = EditState::RolledBack;
    }

    fn check_editable(&self) -> Result<()> {
        if self.state != EditState::Editable {
            return Err(SnapError::ReadOnlyViolation(format!(
                "transaction is {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn commit_inner(&mut self) -> Result<()> {
        let structure = Arc::clone(&self.structure);
        let medium = structure.medium();
        let block_size = medium.block_size() as usize;
        let payload = block_size - TRAILER_SIZE - 4;
        let old_header = structure.committed.read().clone();
        let new_seq = old_header.snapshot_seq + 1;

        // Metadata written during commit must land on blocks that are free
        // in BOTH the old and new states: a crash between the metadata
        // writes and the header write leaves the old header live, so
        // nothing it references (including blocks freed this transaction
        // and the old bitmap chain) may be overwritten yet. The shadow map
        // still holds all of those in-use, so it is the allocation source.
        let mut alloc_map = self.shadow.clone();

        let mut allocate = |map: &mut BitArray| -> Result<u32> {
            let bit = match map.find_first_cleared() {
                Some(bit) => bit,
                None => {
                    let old_len = map.len();
                    map.grow(old_len + 1);
                    medium.grow(map.len() as u32)?;
                    old_len
                }
            };
            map.set(bit);
            Ok(bit as u32)
        };

        // Overflow sub-file table block, when the directory outgrows the
        // header block.
        let mut candidate = FileHeaderBlock {
            version: old_header.version,
            block_size: medium.block_size(),
            snapshot_seq: new_seq,
            alloc_bitmap_root: NIL_BLOCK,
            next_free_block: 0,
            sub_file_table_root: NIL_BLOCK,
            flags: self.flags.clone(),
            sub_files: self.sub_files.clone(),
        };
        let table_block = if candidate.table_fits_inline() {
            None
        } else {
            Some(allocate(&mut alloc_map)?)
        };
        candidate.sub_file_table_root = table_block.unwrap_or(NIL_BLOCK);

        // Bitmap chain: sized against the map that already contains its own
        // blocks. Allocation can grow the map, so iterate to a fixed point.
        let mut chain: Vec<u32> = Vec::new();
        loop {
            let needed = alloc_map.len().div_ceil(8).div_ceil(payload);
            if chain.len() >= needed {
                break;
            }
            let block = allocate(&mut alloc_map)?;
            chain.push(block);
        }

        // Post-commit view: data frees applied, old metadata blocks freed.
        let mut new_map = alloc_map;
        for &block in &self.frees {
            new_map.clear(block as usize);
        }
        {
            let allocation = structure.allocation.lock();
            for &block in &allocation.bitmap_chain {
                new_map.clear(block as usize);
            }
            if let Some(block) = allocation.table_block {
                new_map.clear(block as usize);
            }
        }
        candidate.alloc_bitmap_root = chain.first().copied().unwrap_or(NIL_BLOCK);
        candidate.next_free_block = new_map
            .find_first_cleared()
            .map(|bit| bit as u32)
            .unwrap_or(new_map.len() as u32);

        // All mutated data blocks were written through sessions already;
        // now write metadata, barrier, then the header last.
        let mut session = DiskIoSession::new(Arc::clone(medium), Arc::clone(structure.pool()))?;
        if let Some(block) = table_block {
            let table = candidate.encode_table();
            if table.len() > block_size - TRAILER_SIZE {
                return Err(SnapError::DiskFull(
                    "sub-file table exceeds one block".to_string(),
                ));
            }
            session.write_body(block, &table)?;
        }

        let bitmap_bytes = new_map.to_bytes();
        for (i, &block) in chain.iter().enumerate() {
            let start = i * payload;
            let end = (start + payload).min(bitmap_bytes.len());
            let next = chain.get(i + 1).copied().unwrap_or(NIL_BLOCK);
            session.write(block, |body| {
                body[..end - start].copy_from_slice(&bitmap_bytes[start..end]);
                body[payload..payload + 4].copy_from_slice(&next.to_le_bytes());
            })?;
        }
        medium.flush()?;

        let mut encode_err = None;
        session.write(0, |body| {
            if let Err(e) = candidate.encode(body) {
                encode_err = Some(e);
            }
        })?;
        if let Some(e) = encode_err {
            return Err(e);
        }
        medium.flush()?;

        // Publish. Frees stay parked while an older snapshot is live.
        let mut allocation = structure.allocation.lock();
        let mut snapshots = structure.snapshots.lock();
        let mut master = new_map;
        if !self.frees.is_empty() && !snapshots.live.is_empty() {
            for &block in &self.frees {
                master.set(block as usize);
            }
            snapshots.parked.push_back((new_seq, std::mem::take(&mut self.frees)));
        }
        allocation.map = master;
        allocation.bitmap_chain = chain;
        allocation.table_block = table_block;
        *structure.committed.write() = Arc::new(candidate);
        snapshots.drain(&mut allocation.map);

        debug!(snapshot_seq = new_seq, "transaction committed");
        Ok(())
    }
}

impl Drop for TransactionalEdit {
    fn drop(&mut self) {
        if self.state == EditState::Editable {
            warn!("transaction dropped without commit; rolling back");
        }
        self.structure.editor_active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPoolSettings;

    fn test_pool() -> Arc<MemoryPool> {
        MemoryPool::new(MemoryPoolSettings {
            page_size: 4096,
            minimum_bytes: 0,
            target_bytes: 8 << 20,
            maximum_bytes: 8 << 20,
        })
        .unwrap()
    }

    #[test]
    fn test_single_editor_enforced() {
        let structure = FileStructure::create_memory(test_pool(), 4096).unwrap();
        let edit = structure.begin_edit().unwrap();
        assert!(matches!(
            structure.begin_edit(),
            Err(SnapError::EditorActive)
        ));
        edit.rollback();
        assert!(structure.begin_edit().is_ok());
    }

    #[test]
    fn test_empty_commit_keeps_sequence() {
        let structure = FileStructure::create_memory(test_pool(), 4096).unwrap();
        assert_eq!(structure.latest_snapshot_seq(), 0);
        structure.begin_edit().unwrap().commit().unwrap();
        assert_eq!(structure.latest_snapshot_seq(), 0);
    }

    #[test]
    fn test_allocate_free_commit_cycle() {
        let structure = FileStructure::create_memory(test_pool(), 4096).unwrap();

        let mut edit = structure.begin_edit().unwrap();
        let a = edit.allocate_block().unwrap();
        let b = edit.allocate_block().unwrap();
        assert_ne!(a, b);
        let mut session = edit.create_session().unwrap();
        session.write(a, |body| body[0] = 1).unwrap();
        session.write(b, |body| body[0] = 2).unwrap();
        edit.commit().unwrap();
        assert_eq!(structure.latest_snapshot_seq(), 1);

        // Freeing then allocating inside one transaction never reuses the
        // freed block before commit.
        let mut edit = structure.begin_edit().unwrap();
        edit.free_block(a).unwrap();
        let fresh: Vec<u32> = (0..4).map(|_| edit.allocate_block().unwrap()).collect();
        assert!(!fresh.contains(&a));
        let mut session = edit.create_session().unwrap();
        for &block in &fresh {
            session.write(block, |body| body[0] = 9).unwrap();
        }
        edit.commit().unwrap();

        // After commit with no live snapshot, the freed block is eligible
        // immediately.
        let mut edit = structure.begin_edit().unwrap();
        let mut found = false;
        for _ in 0..8 {
            if edit.allocate_block().unwrap() == a {
                found = true;
                break;
            }
        }
        assert!(found, "freed block was not reused after commit");
        edit.rollback();
    }

    #[test]
    fn test_rollback_discards_allocations() {
        let structure = FileStructure::create_memory(test_pool(), 4096).unwrap();
        let mut edit = structure.begin_edit().unwrap();
        let block = edit.allocate_block().unwrap();
        edit.rollback();

        let mut edit = structure.begin_edit().unwrap();
        assert_eq!(edit.allocate_block().unwrap(), block);
        edit.rollback();
    }

    #[test]
    fn test_live_snapshot_parks_frees() {
        let structure = FileStructure::create_memory(test_pool(), 4096).unwrap();
        let mut edit = structure.begin_edit().unwrap();
        let block = edit.allocate_block().unwrap();
        let mut session = edit.create_session().unwrap();
        session.write(block, |body| body[0] = 5).unwrap();
        edit.commit().unwrap();

        let snapshot = structure.acquire_read_snapshot();

        let mut edit = structure.begin_edit().unwrap();
        edit.free_block(block).unwrap();
        edit.commit().unwrap();

        // Reader still live: the block must not be handed out again.
        let mut edit = structure.begin_edit().unwrap();
        for _ in 0..4 {
            assert_ne!(edit.allocate_block().unwrap(), block);
        }
        edit.rollback();

        drop(snapshot);
        let mut edit = structure.begin_edit().unwrap();
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(edit.allocate_block().unwrap());
        }
        assert!(seen.contains(&block), "parked free never became eligible");
        edit.rollback();
    }

    #[test]
    fn test_create_sub_file_and_reopen_memory_header() {
        let structure = FileStructure::create_memory(test_pool(), 4096).unwrap();
        let mut edit = structure.begin_edit().unwrap();
        let id = edit
            .create_sub_file("points", Uuid::nil(), Uuid::nil(), Uuid::nil())
            .unwrap();
        edit.commit().unwrap();

        let snapshot = structure.acquire_read_snapshot();
        let sub = snapshot.sub_file(id).unwrap();
        assert_eq!(sub.name, "points");
        assert_eq!(snapshot.snapshot_seq(), 1);
    }

    #[test]
    fn test_file_backend_commit_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.d2i");
        let pool = test_pool();

        let id;
        {
            let structure = FileStructure::create_file(&path, Arc::clone(&pool), 4096).unwrap();
            let mut edit = structure.begin_edit().unwrap();
            id = edit
                .create_sub_file("points", Uuid::nil(), Uuid::nil(), Uuid::nil())
                .unwrap();
            let block = edit.allocate_block().unwrap();
            let mut session = edit.create_session().unwrap();
            session.write(block, |body| body[..4].copy_from_slice(b"data")).unwrap();
            edit.commit().unwrap();
        }

        let reopened = FileStructure::open_file(&path, pool, true).unwrap();
        assert_eq!(reopened.latest_snapshot_seq(), 1);
        let snapshot = reopened.acquire_read_snapshot();
        assert_eq!(snapshot.sub_file(id).unwrap().name, "points");
    }
}
