// SnapDB - archival key/value storage core
// Core library module

pub mod collections;
pub mod config;
pub mod error;
pub mod memory;
pub mod storage;
pub mod tree;

pub use config::ArchiveConfig;
pub use error::{Result, SnapError};
