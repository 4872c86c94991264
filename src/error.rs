use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch on block {block}")]
    ChecksumInvalid { block: u32 },

    #[error("block snapshot {block_snapshot} is newer than reader snapshot {reader_snapshot}")]
    SnapshotNewerThanReader {
        block_snapshot: u64,
        reader_snapshot: u64,
    },

    #[error("sub-file mismatch: {0}")]
    SubFileMismatch(String),

    #[error("block index mismatch: requested {requested}, container holds {limit} blocks")]
    IndexMismatch { requested: u32, limit: u32 },

    #[error("block type mismatch: expected level {expected}, found level {found}")]
    BlockTypeMismatch { expected: u8, found: u8 },

    #[error("duplicate key")]
    DuplicateKey,

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("read-only violation: {0}")]
    ReadOnlyViolation(String),

    #[error("operation canceled")]
    Canceled,

    #[error("corrupt header: {0}")]
    CorruptHeader(String),

    #[error("sub-file not found: {0}")]
    SubFileNotFound(String),

    #[error("editor already active")]
    EditorActive,

    #[error("unknown encoding: {0}")]
    UnknownEncoding(uuid::Uuid),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, SnapError>;
