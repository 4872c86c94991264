use crate::error::Result;
use crate::memory::{MemoryPool, PageBuffer};
use crate::storage::checksum::{self, ChecksumStatus, TRAILER_SIZE};
use crate::storage::medium::DiskMedium;
use std::sync::Arc;

/// Per-session block cursor. Holds exactly one pinned page leased from the
/// pool and is the sole mutator of that page for its lifetime. Loads are
/// verified against the block trailer; writes pass through the
/// `MustBeRecomputed -> NotComputed -> Valid` status sequence before they
/// reach the medium.
pub struct DiskIoSession {
    medium: Arc<dyn DiskMedium>,
    pool: Arc<MemoryPool>,
    page: Option<PageBuffer>,
    current: Option<u32>,
}

impl DiskIoSession {
    pub fn new(medium: Arc<dyn DiskMedium>, pool: Arc<MemoryPool>) -> Result<Self> {
        if pool.page_size() != medium.block_size() as usize {
            return Err(crate::error::SnapError::InvalidConfig(format!(
                "pool page size {} does not match block size {}",
                pool.page_size(),
                medium.block_size()
            )));
        }
        let page = pool.allocate()?;
        Ok(Self {
            medium,
            pool,
            page: Some(page),
            current: None,
        })
    }

    pub fn block_size(&self) -> usize {
        self.medium.block_size() as usize
    }

    /// Usable bytes per block once the trailer is reserved.
    pub fn body_size(&self) -> usize {
        self.block_size() - TRAILER_SIZE
    }

    pub fn current_block(&self) -> Option<u32> {
        self.current
    }

    /// Forgets the pinned block so the next read reloads from the medium.
    pub fn invalidate(&mut self) {
        self.current = None;
    }

    /// Loads `block` (reusing the pinned copy when already current) and
    /// returns its body. Trailer verification failures surface as
    /// `ChecksumInvalid`.
    pub fn read(&mut self, block: u32) -> Result<&[u8]> {
        if self.current != Some(block) {
            let page = self.page.as_mut().expect("session page pinned");
            self.medium.read_block(block, page.data_mut())?;
            checksum::verify(page.data(), block)?;
            self.current = Some(block);
        }
        let page = self.page.as_ref().expect("session page pinned");
        Ok(&page.data()[..self.medium.block_size() as usize - TRAILER_SIZE])
    }

    /// Writes `block` by handing the zeroed body to `fill`, then stamping
    /// the trailer and pushing through the medium.
    pub fn write(&mut self, block: u32, fill: impl FnOnce(&mut [u8])) -> Result<()> {
        let body_size = self.body_size();
        let page = self.page.as_mut().expect("session page pinned");
        let data = page.data_mut();
        data.fill(0);
        checksum::mark(data, ChecksumStatus::MustBeRecomputed);
        fill(&mut data[..body_size]);
        checksum::mark(data, ChecksumStatus::NotComputed);
        checksum::stamp_valid(data);
        self.medium.write_block(block, data)?;
        self.current = Some(block);
        Ok(())
    }

    /// Writes a pre-composed body image to `block`.
    pub fn write_body(&mut self, block: u32, body: &[u8]) -> Result<()> {
        self.write(block, |dest| dest[..body.len()].copy_from_slice(body))
    }
}

impl Drop for DiskIoSession {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            self.pool.release(page);
        }
    }
}
