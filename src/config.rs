use crate::error::{Result, SnapError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// Extensions carry exactly one dot, at the front: ".d2i", ".d2".
fn validate_extension(extension: &str) -> Result<()> {
    let trimmed = extension.strip_prefix('.').ok_or_else(|| {
        SnapError::InvalidConfig(format!("extension {:?} must start with a dot", extension))
    })?;
    if trimmed.is_empty() || trimmed.contains('.') {
        return Err(SnapError::InvalidConfig(format!(
            "extension {:?} must be non-empty with a single dot",
            extension
        )));
    }
    Ok(())
}

/// Memory budget handed to the pool. Freezes with its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolBudget {
    target_bytes: usize,
    maximum_bytes: usize,
    frozen: bool,
}

impl PoolBudget {
    pub fn new(target_bytes: usize, maximum_bytes: usize) -> Self {
        Self {
            target_bytes,
            maximum_bytes,
            frozen: false,
        }
    }

    pub fn target_bytes(&self) -> usize {
        self.target_bytes
    }

    pub fn maximum_bytes(&self) -> usize {
        self.maximum_bytes
    }

    pub fn set_target_bytes(&mut self, bytes: usize) -> Result<()> {
        self.check_writable()?;
        self.target_bytes = bytes;
        Ok(())
    }

    pub fn set_maximum_bytes(&mut self, bytes: usize) -> Result<()> {
        self.check_writable()?;
        self.maximum_bytes = bytes;
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn check_writable(&self) -> Result<()> {
        if self.frozen {
            return Err(SnapError::ReadOnlyViolation(
                "pool budget is frozen".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolBudget {
    fn default() -> Self {
        Self::new(64 << 20, 256 << 20)
    }
}

/// External configuration surface consumed by the storage core. The
/// object is editable until `freeze()`; afterwards every mutator fails
/// with `ReadOnlyViolation`. `clone_editable` always hands back a mutable
/// deep copy; `clone_readonly` is a no-op on frozen objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    root_path: PathBuf,
    intermediate_extension: String,
    final_extension: String,
    pool: PoolBudget,
    target_file_size: u64,
    desired_remaining_space: u64,
    staging_count: u32,
    frozen: bool,
}

impl ArchiveConfig {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            intermediate_extension: ".d2i".to_string(),
            final_extension: ".d2".to_string(),
            pool: PoolBudget::default(),
            target_file_size: 2 << 30,
            desired_remaining_space: 500 << 20,
            staging_count: 3,
            frozen: false,
        }
    }

    pub fn root_path(&self) -> &PathBuf {
        &self.root_path
    }

    pub fn intermediate_extension(&self) -> &str {
        &self.intermediate_extension
    }

    pub fn final_extension(&self) -> &str {
        &self.final_extension
    }

    pub fn pool(&self) -> &PoolBudget {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> Result<&mut PoolBudget> {
        self.check_writable()?;
        Ok(&mut self.pool)
    }

    pub fn target_file_size(&self) -> u64 {
        self.target_file_size
    }

    pub fn desired_remaining_space(&self) -> u64 {
        self.desired_remaining_space
    }

    pub fn staging_count(&self) -> u32 {
        self.staging_count
    }

    pub fn set_root_path(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.check_writable()?;
        self.root_path = path.into();
        Ok(())
    }

    pub fn set_intermediate_extension(&mut self, extension: &str) -> Result<()> {
        self.check_writable()?;
        validate_extension(extension)?;
        self.intermediate_extension = extension.to_string();
        Ok(())
    }

    pub fn set_final_extension(&mut self, extension: &str) -> Result<()> {
        self.check_writable()?;
        validate_extension(extension)?;
        self.final_extension = extension.to_string();
        Ok(())
    }

    pub fn set_target_file_size(&mut self, bytes: u64) -> Result<()> {
        self.check_writable()?;
        self.target_file_size = bytes;
        Ok(())
    }

    pub fn set_desired_remaining_space(&mut self, bytes: u64) -> Result<()> {
        self.check_writable()?;
        self.desired_remaining_space = bytes;
        Ok(())
    }

    pub fn set_staging_count(&mut self, count: u32) -> Result<()> {
        self.check_writable()?;
        self.staging_count = count;
        Ok(())
    }

    /// Publishes the object: itself and every nested member become
    /// immutable.
    pub fn freeze(&mut self) {
        self.pool.freeze();
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// A mutable deep copy, regardless of freeze state.
    pub fn clone_editable(&self) -> Self {
        let mut copy = self.clone();
        copy.frozen = false;
        copy.pool.frozen = false;
        copy
    }

    /// A frozen copy; on an already-frozen object this is just a clone.
    pub fn clone_readonly(&self) -> Self {
        if self.frozen {
            return self.clone();
        }
        let mut copy = self.clone();
        copy.freeze();
        copy
    }

    fn check_writable(&self) -> Result<()> {
        if self.frozen {
            return Err(SnapError::ReadOnlyViolation(
                "archive config is frozen".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_validation() {
        let mut config = ArchiveConfig::new("/data");
        assert!(config.set_final_extension("d2").is_err());
        assert!(config.set_final_extension(".").is_err());
        assert!(config.set_final_extension(".d2.bak").is_err());
        config.set_final_extension(".dat").unwrap();
        assert_eq!(config.final_extension(), ".dat");
    }

    #[test]
    fn test_freeze_blocks_mutation_transitively() {
        let mut config = ArchiveConfig::new("/data");
        config.pool_mut().unwrap().set_target_bytes(1 << 20).unwrap();
        config.freeze();

        assert!(matches!(
            config.set_staging_count(5),
            Err(SnapError::ReadOnlyViolation(_))
        ));
        assert!(config.pool_mut().is_err());
        assert!(config.is_frozen());
        assert!(config.pool().is_frozen());
    }

    #[test]
    fn test_clone_editable_unfreezes_deeply() {
        let mut config = ArchiveConfig::new("/data");
        config.freeze();

        let mut editable = config.clone_editable();
        assert!(!editable.is_frozen());
        editable.set_staging_count(7).unwrap();
        editable.pool_mut().unwrap().set_maximum_bytes(1 << 30).unwrap();

        // The original stays frozen.
        assert!(config.is_frozen());
        assert_eq!(config.staging_count(), 3);
    }

    #[test]
    fn test_clone_readonly() {
        let config = ArchiveConfig::new("/data");
        let frozen = config.clone_readonly();
        assert!(frozen.is_frozen());
        assert!(!config.is_frozen());
        assert!(frozen.clone_readonly().is_frozen());
    }
}
