use crate::error::{Result, SnapError};
use crate::storage::file_structure::{ReadSnapshot, TransactionalEdit};
use crate::storage::io_session::DiskIoSession;
use crate::storage::NIL_BLOCK;

/// Session pair set for a writable sub-file open.
///
/// Shadow copies made during a node split are written through the
/// destination sessions so the source page (the node being split) stays
/// pinned; after the split lands, `swap_data` / `swap_index` promote the
/// destination to source.
pub struct SubFileIo {
    source_data: DiskIoSession,
    destination_data: DiskIoSession,
    source_index: DiskIoSession,
    destination_index: DiskIoSession,
}

impl SubFileIo {
    pub fn open(edit: &TransactionalEdit) -> Result<Self> {
        Ok(Self {
            source_data: edit.create_session()?,
            destination_data: edit.create_session()?,
            source_index: edit.create_session()?,
            destination_index: edit.create_session()?,
        })
    }

    pub fn source_data(&mut self) -> &mut DiskIoSession {
        &mut self.source_data
    }

    pub fn destination_data(&mut self) -> &mut DiskIoSession {
        &mut self.destination_data
    }

    pub fn source_index(&mut self) -> &mut DiskIoSession {
        &mut self.source_index
    }

    pub fn destination_index(&mut self) -> &mut DiskIoSession {
        &mut self.destination_index
    }

    /// Both data sessions, for read-source-write-destination operations.
    pub fn data_pair(&mut self) -> (&mut DiskIoSession, &mut DiskIoSession) {
        (&mut self.source_data, &mut self.destination_data)
    }

    pub fn index_pair(&mut self) -> (&mut DiskIoSession, &mut DiskIoSession) {
        (&mut self.source_index, &mut self.destination_index)
    }

    /// Promotes the destination data session to source.
    pub fn swap_data(&mut self) {
        std::mem::swap(&mut self.source_data, &mut self.destination_data);
    }

    /// Promotes the destination index session to source.
    pub fn swap_index(&mut self) {
        std::mem::swap(&mut self.source_index, &mut self.destination_index);
    }
}

/// Source-only sessions for a read-only sub-file open: one session walks
/// leaves, the other resolves internal nodes, so a seek never evicts the
/// pinned leaf.
pub struct SubFileReadIo {
    data: DiskIoSession,
    index: DiskIoSession,
}

impl SubFileReadIo {
    pub fn open(snapshot: &ReadSnapshot) -> Result<Self> {
        Ok(Self {
            data: snapshot.create_session()?,
            index: snapshot.create_session()?,
        })
    }

    /// Wraps pre-built sessions; used for scans inside a transaction.
    pub fn from_sessions(data: DiskIoSession, index: DiskIoSession) -> Self {
        Self { data, index }
    }

    pub fn data(&mut self) -> &mut DiskIoSession {
        &mut self.data
    }

    pub fn index(&mut self) -> &mut DiskIoSession {
        &mut self.index
    }
}

// Sub-file block table: maps dense virtual block indices to physical
// container blocks. Tree-internal pointers (children, siblings, root) are
// virtual, so shadow-relocating a node only remaps its table entry and
// every committed reference stays valid.
//
// Root block body: depth (u8; 0 = direct, 1 = indirect), count (u32),
// then u32 entries. Direct entries are node physicals; indirect entries
// point at sub-table blocks holding plain u32 arrays.

const TABLE_HEADER: usize = 5;

fn root_capacity(body_len: usize) -> usize {
    (body_len - TABLE_HEADER) / 4
}

fn sub_capacity(body_len: usize) -> usize {
    body_len / 4
}

fn read_u32s(body: &[u8], at: usize, count: usize, out: &mut Vec<u32>) {
    for i in 0..count {
        let off = at + i * 4;
        out.push(u32::from_le_bytes(body[off..off + 4].try_into().unwrap()));
    }
}

/// Loads a whole block table into memory. Returns the virtual-to-physical
/// entries and the physical blocks the table itself occupies (for freeing
/// when the table is rewritten).
pub fn load_block_table(
    session: &mut DiskIoSession,
    table_root: u32,
) -> Result<(Vec<u32>, Vec<u32>)> {
    if table_root == NIL_BLOCK {
        return Ok((Vec::new(), Vec::new()));
    }
    let body_len = session.body_size();
    let (depth, count, mut entries) = {
        let body = session.read(table_root)?;
        let depth = body[0];
        let count = u32::from_le_bytes(body[1..5].try_into().unwrap()) as usize;
        let take = if depth == 0 {
            count
        } else {
            count.div_ceil(sub_capacity(body_len))
        };
        if take > root_capacity(body_len) {
            return Err(SnapError::Storage("block table root overflows".to_string()));
        }
        let mut first = Vec::new();
        read_u32s(body, TABLE_HEADER, take, &mut first);
        (depth, count, first)
    };

    let mut table_blocks = vec![table_root];
    match depth {
        0 => {
            if count > entries.len() {
                return Err(SnapError::Storage("block table truncated".to_string()));
            }
            entries.truncate(count);
            Ok((entries, table_blocks))
        }
        1 => {
            let mut physicals = Vec::with_capacity(count);
            let per_block = sub_capacity(body_len);
            for &sub_block in &entries {
                let remaining = count - physicals.len();
                let body = session.read(sub_block)?;
                read_u32s(body, 0, remaining.min(per_block), &mut physicals);
            }
            if physicals.len() != count {
                return Err(SnapError::Storage("block table truncated".to_string()));
            }
            table_blocks.extend_from_slice(&entries);
            Ok((physicals, table_blocks))
        }
        other => Err(SnapError::Storage(format!(
            "unknown block table depth {}",
            other
        ))),
    }
}

/// Writes a block table to freshly allocated blocks. Returns the new root
/// and every block the table occupies.
pub fn write_block_table(
    edit: &mut TransactionalEdit,
    entries: &[u32],
) -> Result<(u32, Vec<u32>)> {
    let mut session = edit.create_session()?;
    let body_len = session.body_size();
    let root_cap = root_capacity(body_len);
    let sub_cap = sub_capacity(body_len);

    if entries.len() <= root_cap {
        let root = edit.allocate_block()?;
        session.write(root, |body| {
            body[0] = 0;
            body[1..5].copy_from_slice(&(entries.len() as u32).to_le_bytes());
            for (i, &physical) in entries.iter().enumerate() {
                let at = TABLE_HEADER + i * 4;
                body[at..at + 4].copy_from_slice(&physical.to_le_bytes());
            }
        })?;
        return Ok((root, vec![root]));
    }

    let chunks: Vec<&[u32]> = entries.chunks(sub_cap).collect();
    if chunks.len() > root_cap {
        return Err(SnapError::DiskFull(format!(
            "sub-file exceeds {} addressable blocks",
            root_cap * sub_cap
        )));
    }
    let mut blocks = Vec::with_capacity(chunks.len() + 1);
    let mut pointers = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        let block = edit.allocate_block()?;
        session.write(block, |body| {
            for (i, &physical) in chunk.iter().enumerate() {
                body[i * 4..i * 4 + 4].copy_from_slice(&physical.to_le_bytes());
            }
        })?;
        pointers.push(block);
        blocks.push(block);
    }
    let root = edit.allocate_block()?;
    session.write(root, |body| {
        body[0] = 1;
        body[1..5].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        for (i, &pointer) in pointers.iter().enumerate() {
            let at = TABLE_HEADER + i * 4;
            body[at..at + 4].copy_from_slice(&pointer.to_le_bytes());
        }
    })?;
    blocks.insert(0, root);
    Ok((root, blocks))
}

/// Read-side virtual-to-physical resolution. Direct tables are cached
/// whole at open; indirect tables cache the pointer array and read one
/// sub-table block per lookup through the index session, which keeps the
/// hot block pinned across sequential scans.
pub enum BlockTableReader {
    Direct(Vec<u32>),
    Indirect {
        count: usize,
        pointers: Vec<u32>,
        per_block: usize,
    },
    /// In-memory table for staged, not-yet-persisted trees.
    Memory(Vec<u32>),
}

impl BlockTableReader {
    pub fn open(session: &mut DiskIoSession, table_root: u32) -> Result<Self> {
        let body_len = session.body_size();
        let body = session.read(table_root)?;
        let depth = body[0];
        let count = u32::from_le_bytes(body[1..5].try_into().unwrap()) as usize;
        match depth {
            0 => {
                let mut entries = Vec::with_capacity(count);
                if count > root_capacity(body_len) {
                    return Err(SnapError::Storage("block table truncated".to_string()));
                }
                read_u32s(body, TABLE_HEADER, count, &mut entries);
                Ok(Self::Direct(entries))
            }
            1 => {
                let per_block = sub_capacity(body_len);
                let pointer_count = count.div_ceil(per_block);
                if pointer_count > root_capacity(body_len) {
                    return Err(SnapError::Storage("block table root overflows".to_string()));
                }
                let mut pointers = Vec::with_capacity(pointer_count);
                read_u32s(body, TABLE_HEADER, pointer_count, &mut pointers);
                Ok(Self::Indirect {
                    count,
                    pointers,
                    per_block,
                })
            }
            other => Err(SnapError::Storage(format!(
                "unknown block table depth {}",
                other
            ))),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Direct(entries) | Self::Memory(entries) => entries.len(),
            Self::Indirect { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resolve(&self, session: &mut DiskIoSession, virtual_index: u32) -> Result<u32> {
        let index = virtual_index as usize;
        match self {
            Self::Direct(entries) | Self::Memory(entries) => {
                entries.get(index).copied().ok_or(SnapError::IndexMismatch {
                    requested: virtual_index,
                    limit: entries.len() as u32,
                })
            }
            Self::Indirect {
                count,
                pointers,
                per_block,
            } => {
                if index >= *count {
                    return Err(SnapError::IndexMismatch {
                        requested: virtual_index,
                        limit: *count as u32,
                    });
                }
                let body = session.read(pointers[index / per_block])?;
                let at = (index % per_block) * 4;
                Ok(u32::from_le_bytes(body[at..at + 4].try_into().unwrap()))
            }
        }
    }
}
