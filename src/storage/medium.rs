use crate::error::{Result, SnapError};
use crate::memory::{MemoryPool, PageBuffer};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Paged address space under the container. Backends expose identical
/// block semantics; checksum stamping and verification live in the
/// session layer above.
pub trait DiskMedium: Send + Sync {
    fn block_size(&self) -> u32;
    fn block_count(&self) -> u32;
    fn read_block(&self, index: u32, buf: &mut [u8]) -> Result<()>;
    fn write_block(&self, index: u32, buf: &[u8]) -> Result<()>;
    /// Extends the address space. Never shrinks.
    fn grow(&self, new_block_count: u32) -> Result<()>;
    /// Durability barrier: all prior writes reach the backing store.
    fn flush(&self) -> Result<()>;
}

fn check_range(index: u32, count: u32) -> Result<()> {
    if index >= count {
        return Err(SnapError::IndexMismatch {
            requested: index,
            limit: count,
        });
    }
    Ok(())
}

/// Heap-resident container backed by pool pages. Used for ephemeral and
/// staging files; pages return to the pool when the medium drops.
pub struct MemoryMedium {
    pool: Arc<MemoryPool>,
    block_size: u32,
    pages: RwLock<Vec<PageBuffer>>,
}

impl MemoryMedium {
    pub fn new(pool: Arc<MemoryPool>, block_size: u32) -> Result<Self> {
        if pool.page_size() != block_size as usize {
            return Err(SnapError::InvalidConfig(format!(
                "pool page size {} does not match block size {}",
                pool.page_size(),
                block_size
            )));
        }
        Ok(Self {
            pool,
            block_size,
            pages: RwLock::new(Vec::new()),
        })
    }
}

impl DiskMedium for MemoryMedium {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.pages.read().len() as u32
    }

    fn read_block(&self, index: u32, buf: &mut [u8]) -> Result<()> {
        let pages = self.pages.read();
        check_range(index, pages.len() as u32)?;
        buf.copy_from_slice(pages[index as usize].data());
        Ok(())
    }

    fn write_block(&self, index: u32, buf: &[u8]) -> Result<()> {
        let mut pages = self.pages.write();
        check_range(index, pages.len() as u32)?;
        pages[index as usize].data_mut().copy_from_slice(buf);
        Ok(())
    }

    fn grow(&self, new_block_count: u32) -> Result<()> {
        let mut pages = self.pages.write();
        while (pages.len() as u32) < new_block_count {
            pages.push(self.pool.allocate()?);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl Drop for MemoryMedium {
    fn drop(&mut self) {
        let pages = std::mem::take(&mut *self.pages.write());
        self.pool.release_many(pages);
    }
}

/// Buffered file over an OS file with explicit positioned reads and
/// writes; no reliance on process-wide caches beyond the session layer.
pub struct BufferedFileMedium {
    file: Mutex<File>,
    path: Mutex<PathBuf>,
    block_size: u32,
    block_count: Mutex<u32>,
    read_only: Mutex<bool>,
    shared_read: Mutex<bool>,
}

impl BufferedFileMedium {
    pub fn create(path: impl Into<PathBuf>, block_size: u32) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: Mutex::new(path),
            block_size,
            block_count: Mutex::new(0),
            read_only: Mutex::new(false),
            shared_read: Mutex::new(true),
        })
    }

    pub fn open(path: impl Into<PathBuf>, block_size: u32, read_only: bool) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        let len = file.metadata()?.len();
        if len % block_size as u64 != 0 {
            return Err(SnapError::CorruptHeader(format!(
                "file length {} is not a multiple of block size {}",
                len, block_size
            )));
        }
        Ok(Self {
            file: Mutex::new(file),
            path: Mutex::new(path),
            block_size,
            block_count: Mutex::new((len / block_size as u64) as u32),
            read_only: Mutex::new(read_only),
            shared_read: Mutex::new(true),
        })
    }

    /// Renames the container to carry `new_extension` (single leading dot)
    /// and reopens it under the current share mode.
    pub fn change_extension(&self, new_extension: &str) -> Result<()> {
        let trimmed = new_extension.strip_prefix('.').ok_or_else(|| {
            SnapError::InvalidConfig(format!("extension {:?} must start with a dot", new_extension))
        })?;
        if trimmed.is_empty() || trimmed.contains('.') {
            return Err(SnapError::InvalidConfig(format!(
                "extension {:?} must be non-empty with a single dot",
                new_extension
            )));
        }

        let mut path = self.path.lock();
        let new_path = path.with_extension(trimmed);
        std::fs::rename(&*path, &new_path)?;
        debug!(from = %path.display(), to = %new_path.display(), "container renamed");
        *path = new_path.clone();

        let read_only = *self.read_only.lock();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&new_path)?;
        *self.file.lock() = file;
        Ok(())
    }

    /// Reopens the file under a new sharing policy. `shared_read` is an
    /// advisory hint recorded for the rollover driver; the open mode
    /// itself only distinguishes read-only from writable.
    pub fn change_share_mode(&self, read_only: bool, shared_read: bool) -> Result<()> {
        let path = self.path.lock();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&*path)?;
        *self.file.lock() = file;
        *self.read_only.lock() = read_only;
        *self.shared_read.lock() = shared_read;
        Ok(())
    }

    pub fn path(&self) -> PathBuf {
        self.path.lock().clone()
    }

    fn offset(&self, index: u32) -> u64 {
        index as u64 * self.block_size as u64
    }
}

impl DiskMedium for BufferedFileMedium {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        *self.block_count.lock()
    }

    fn read_block(&self, index: u32, buf: &mut [u8]) -> Result<()> {
        check_range(index, self.block_count())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset(index)))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&self, index: u32, buf: &[u8]) -> Result<()> {
        if *self.read_only.lock() {
            return Err(SnapError::ReadOnlyViolation(
                "write on a read-only container".to_string(),
            ));
        }
        check_range(index, self.block_count())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.offset(index)))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn grow(&self, new_block_count: u32) -> Result<()> {
        let mut count = self.block_count.lock();
        if new_block_count <= *count {
            return Ok(());
        }
        let file = self.file.lock();
        file.set_len(new_block_count as u64 * self.block_size as u64)
            .map_err(|e| SnapError::DiskFull(format!("cannot extend container: {}", e)))?;
        *count = new_block_count;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPoolSettings;
    use tempfile::tempdir;

    fn test_pool() -> Arc<MemoryPool> {
        MemoryPool::new(MemoryPoolSettings {
            page_size: 4096,
            minimum_bytes: 0,
            target_bytes: 1 << 20,
            maximum_bytes: 1 << 20,
        })
        .unwrap()
    }

    #[test]
    fn test_memory_medium_round_trip() {
        let medium = MemoryMedium::new(test_pool(), 4096).unwrap();
        medium.grow(3).unwrap();
        assert_eq!(medium.block_count(), 3);

        let mut block = vec![0u8; 4096];
        block[0] = 42;
        medium.write_block(2, &block).unwrap();

        let mut read = vec![0u8; 4096];
        medium.read_block(2, &mut read).unwrap();
        assert_eq!(read[0], 42);
    }

    #[test]
    fn test_out_of_range_is_index_mismatch() {
        let medium = MemoryMedium::new(test_pool(), 4096).unwrap();
        medium.grow(1).unwrap();
        let mut buf = vec![0u8; 4096];
        assert!(matches!(
            medium.read_block(5, &mut buf),
            Err(SnapError::IndexMismatch {
                requested: 5,
                limit: 1
            })
        ));
    }

    #[test]
    fn test_file_medium_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("container.d2i");
        let medium = BufferedFileMedium::create(&path, 4096).unwrap();
        medium.grow(2).unwrap();

        let mut block = vec![0u8; 4096];
        block[100] = 7;
        medium.write_block(1, &block).unwrap();
        medium.flush().unwrap();

        let reopened = BufferedFileMedium::open(&path, 4096, true).unwrap();
        let mut read = vec![0u8; 4096];
        reopened.read_block(1, &mut read).unwrap();
        assert_eq!(read[100], 7);

        assert!(matches!(
            reopened.write_block(1, &block),
            Err(SnapError::ReadOnlyViolation(_))
        ));
    }

    #[test]
    fn test_change_extension_validation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("container.d2i");
        let medium = BufferedFileMedium::create(&path, 4096).unwrap();
        assert!(medium.change_extension("d2").is_err());
        assert!(medium.change_extension(".d2.x").is_err());
        medium.change_extension(".d2").unwrap();
        assert!(medium.path().ends_with("container.d2"));
    }
}
