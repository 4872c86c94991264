// Bounded page memory for the storage core. Every component that touches
// pages leases them from an explicitly supplied pool; the process-wide
// default exists only as a convenience.

pub mod pool;

pub use pool::{
    default_pool, CollectionCallback, CollectionEvent, CollectionMode, MemoryPool,
    MemoryPoolSettings, PageBuffer,
};
