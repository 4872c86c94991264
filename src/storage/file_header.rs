use crate::error::{Result, SnapError};
use crate::storage::checksum::TRAILER_SIZE;
use crate::storage::NIL_BLOCK;
use uuid::Uuid;

/// Container magic, first 16 bytes of block 0.
pub const MAGIC: [u8; 16] = *b"SnapDBContainer\0";
pub const HEADER_VERSION: u16 = 1;

// Fixed header offsets, all little-endian.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 16;
const OFF_BLOCK_SIZE: usize = 18;
const OFF_SNAPSHOT_SEQ: usize = 22;
const OFF_BITMAP_ROOT: usize = 30;
const OFF_NEXT_FREE: usize = 34;
const OFF_SUB_FILE_COUNT: usize = 38;
const OFF_TABLE_ROOT: usize = 40;
const OFF_FLAG_COUNT: usize = 44;
const OFF_FLAGS: usize = 46;

/// Directory entry for one sub-file inside the container.
///
/// Sub-file contents are addressed through a direct/indirect block table
/// rooted at `table_root`; `root_block` is the tree root's index inside
/// that table, so tree-internal pointers survive shadow relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubFileHeader {
    pub id: Uuid,
    pub name: String,
    pub key_type: Uuid,
    pub value_type: Uuid,
    pub encoding: Uuid,
    pub table_root: u32,
    pub root_block: u32,
    pub tree_height: u8,
    pub record_count: u64,
    pub last_modified_snapshot: u64,
}

impl SubFileHeader {
    fn encoded_len(&self) -> usize {
        16 + 2 + self.name.len() + 16 + 16 + 16 + 4 + 4 + 1 + 8 + 8
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(self.key_type.as_bytes());
        out.extend_from_slice(self.value_type.as_bytes());
        out.extend_from_slice(self.encoding.as_bytes());
        out.extend_from_slice(&self.table_root.to_le_bytes());
        out.extend_from_slice(&self.root_block.to_le_bytes());
        out.push(self.tree_height);
        out.extend_from_slice(&self.record_count.to_le_bytes());
        out.extend_from_slice(&self.last_modified_snapshot.to_le_bytes());
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
            if *pos + n > buf.len() {
                return Err(SnapError::CorruptHeader(
                    "sub-file table truncated".to_string(),
                ));
            }
            let slice = &buf[*pos..*pos + n];
            *pos += n;
            Ok(slice)
        }

        let id = Uuid::from_slice(take(buf, pos, 16)?).unwrap();
        let name_len = u16::from_le_bytes(take(buf, pos, 2)?.try_into().unwrap()) as usize;
        let name = String::from_utf8(take(buf, pos, name_len)?.to_vec())
            .map_err(|_| SnapError::CorruptHeader("sub-file name is not UTF-8".to_string()))?;
        let key_type = Uuid::from_slice(take(buf, pos, 16)?).unwrap();
        let value_type = Uuid::from_slice(take(buf, pos, 16)?).unwrap();
        let encoding = Uuid::from_slice(take(buf, pos, 16)?).unwrap();
        let table_root = u32::from_le_bytes(take(buf, pos, 4)?.try_into().unwrap());
        let root_block = u32::from_le_bytes(take(buf, pos, 4)?.try_into().unwrap());
        let tree_height = take(buf, pos, 1)?[0];
        let record_count = u64::from_le_bytes(take(buf, pos, 8)?.try_into().unwrap());
        let last_modified_snapshot = u64::from_le_bytes(take(buf, pos, 8)?.try_into().unwrap());

        Ok(Self {
            id,
            name,
            key_type,
            value_type,
            encoding,
            table_root,
            root_block,
            tree_height,
            record_count,
            last_modified_snapshot,
        })
    }
}

/// Root superblock, stored at block 0. Published headers are immutable;
/// mutation is clone-edit-commit through the transactional editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeaderBlock {
    pub version: u16,
    pub block_size: u32,
    pub snapshot_seq: u64,
    pub alloc_bitmap_root: u32,
    pub next_free_block: u32,
    pub sub_file_table_root: u32,
    pub flags: Vec<Uuid>,
    pub sub_files: Vec<SubFileHeader>,
}

impl FileHeaderBlock {
    pub fn new(block_size: u32) -> Self {
        Self {
            version: HEADER_VERSION,
            block_size,
            snapshot_seq: 0,
            alloc_bitmap_root: NIL_BLOCK,
            next_free_block: 1,
            sub_file_table_root: NIL_BLOCK,
            flags: Vec::new(),
            sub_files: Vec::new(),
        }
    }

    pub fn sub_file(&self, id: Uuid) -> Option<&SubFileHeader> {
        self.sub_files.iter().find(|sub| sub.id == id)
    }

    pub fn sub_file_by_name(&self, name: &str) -> Option<&SubFileHeader> {
        self.sub_files.iter().find(|sub| sub.name == name)
    }

    /// Serialized sub-file table bytes (count-prefixed entries).
    pub fn encode_table(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for sub in &self.sub_files {
            sub.encode(&mut out);
        }
        out
    }

    /// Whether the table fits in block 0 after the fixed fields and flags.
    pub fn table_fits_inline(&self) -> bool {
        let table_len: usize = self.sub_files.iter().map(|s| s.encoded_len()).sum();
        let fixed = OFF_FLAGS + self.flags.len() * 16;
        fixed + table_len + TRAILER_SIZE <= self.block_size as usize
    }

    /// Encodes the header into a block body. When the table does not fit
    /// inline, `sub_file_table_root` must already point at the block that
    /// carries `encode_table()`.
    pub fn encode(&self, body: &mut [u8]) -> Result<()> {
        let inline = self.table_fits_inline();
        if !inline && self.sub_file_table_root == NIL_BLOCK {
            return Err(SnapError::CorruptHeader(
                "sub-file table overflow without a table block".to_string(),
            ));
        }

        body[OFF_MAGIC..OFF_MAGIC + 16].copy_from_slice(&MAGIC);
        body[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&self.version.to_le_bytes());
        body[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 4].copy_from_slice(&self.block_size.to_le_bytes());
        body[OFF_SNAPSHOT_SEQ..OFF_SNAPSHOT_SEQ + 8]
            .copy_from_slice(&self.snapshot_seq.to_le_bytes());
        body[OFF_BITMAP_ROOT..OFF_BITMAP_ROOT + 4]
            .copy_from_slice(&self.alloc_bitmap_root.to_le_bytes());
        body[OFF_NEXT_FREE..OFF_NEXT_FREE + 4].copy_from_slice(&self.next_free_block.to_le_bytes());
        body[OFF_SUB_FILE_COUNT..OFF_SUB_FILE_COUNT + 2]
            .copy_from_slice(&(self.sub_files.len() as u16).to_le_bytes());
        let table_root = if inline { NIL_BLOCK } else { self.sub_file_table_root };
        body[OFF_TABLE_ROOT..OFF_TABLE_ROOT + 4].copy_from_slice(&table_root.to_le_bytes());
        body[OFF_FLAG_COUNT..OFF_FLAG_COUNT + 2]
            .copy_from_slice(&(self.flags.len() as u16).to_le_bytes());

        let mut pos = OFF_FLAGS;
        for flag in &self.flags {
            body[pos..pos + 16].copy_from_slice(flag.as_bytes());
            pos += 16;
        }

        if inline {
            let table = self.encode_table();
            body[pos..pos + table.len()].copy_from_slice(&table);
        }
        Ok(())
    }

    /// Decodes the fixed fields and, when inline, the sub-file table. A
    /// non-NIL `sub_file_table_root` means the caller must follow up with
    /// [`FileHeaderBlock::decode_table`].
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < OFF_FLAGS {
            return Err(SnapError::CorruptHeader("header block too small".to_string()));
        }
        if body[OFF_MAGIC..OFF_MAGIC + 16] != MAGIC {
            return Err(SnapError::CorruptHeader("bad magic".to_string()));
        }
        let version = u16::from_le_bytes(body[OFF_VERSION..OFF_VERSION + 2].try_into().unwrap());
        if version != HEADER_VERSION {
            return Err(SnapError::CorruptHeader(format!(
                "unsupported version {}",
                version
            )));
        }
        let block_size =
            u32::from_le_bytes(body[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 4].try_into().unwrap());
        if !block_size.is_power_of_two() || block_size < 512 {
            return Err(SnapError::CorruptHeader(format!(
                "invalid block size {}",
                block_size
            )));
        }

        let mut header = Self {
            version,
            block_size,
            snapshot_seq: u64::from_le_bytes(
                body[OFF_SNAPSHOT_SEQ..OFF_SNAPSHOT_SEQ + 8].try_into().unwrap(),
            ),
            alloc_bitmap_root: u32::from_le_bytes(
                body[OFF_BITMAP_ROOT..OFF_BITMAP_ROOT + 4].try_into().unwrap(),
            ),
            next_free_block: u32::from_le_bytes(
                body[OFF_NEXT_FREE..OFF_NEXT_FREE + 4].try_into().unwrap(),
            ),
            sub_file_table_root: u32::from_le_bytes(
                body[OFF_TABLE_ROOT..OFF_TABLE_ROOT + 4].try_into().unwrap(),
            ),
            flags: Vec::new(),
            sub_files: Vec::new(),
        };

        let sub_file_count =
            u16::from_le_bytes(body[OFF_SUB_FILE_COUNT..OFF_SUB_FILE_COUNT + 2].try_into().unwrap());
        let flag_count =
            u16::from_le_bytes(body[OFF_FLAG_COUNT..OFF_FLAG_COUNT + 2].try_into().unwrap());

        let mut pos = OFF_FLAGS;
        for _ in 0..flag_count {
            if pos + 16 > body.len() {
                return Err(SnapError::CorruptHeader("flag list truncated".to_string()));
            }
            header.flags.push(Uuid::from_slice(&body[pos..pos + 16]).unwrap());
            pos += 16;
        }

        if header.sub_file_table_root == NIL_BLOCK {
            for _ in 0..sub_file_count {
                header.sub_files.push(SubFileHeader::decode(body, &mut pos)?);
            }
        } else {
            // Table lives in its own block; remember the expected count.
            header.sub_files.reserve(sub_file_count as usize);
        }
        Ok(header)
    }

    /// Parses an overflow sub-file table block body.
    pub fn decode_table(&mut self, body: &[u8], sub_file_count: u16) -> Result<()> {
        let mut pos = 0;
        self.sub_files.clear();
        for _ in 0..sub_file_count {
            self.sub_files.push(SubFileHeader::decode(body, &mut pos)?);
        }
        Ok(())
    }
}

/// The raw sub-file count field, needed to parse an overflow table block.
pub fn decode_sub_file_count(body: &[u8]) -> u16 {
    u16::from_le_bytes(body[OFF_SUB_FILE_COUNT..OFF_SUB_FILE_COUNT + 2].try_into().unwrap())
}

/// Reads the declared block size out of a raw header prefix, used to
/// bootstrap a file open before the medium exists.
pub fn peek_block_size(prefix: &[u8]) -> Result<u32> {
    if prefix.len() < OFF_SNAPSHOT_SEQ {
        return Err(SnapError::CorruptHeader("header prefix too small".to_string()));
    }
    if prefix[OFF_MAGIC..OFF_MAGIC + 16] != MAGIC {
        return Err(SnapError::CorruptHeader("bad magic".to_string()));
    }
    let block_size =
        u32::from_le_bytes(prefix[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 4].try_into().unwrap());
    if !block_size.is_power_of_two() || block_size < 512 {
        return Err(SnapError::CorruptHeader(format!(
            "invalid block size {}",
            block_size
        )));
    }
    Ok(block_size)
}
