pub mod bit_array;
pub mod large_array;
pub mod resource_queue;
pub mod weak_list;

pub use bit_array::BitArray;
pub use large_array::{LargeArray, NullableLargeArray};
pub use resource_queue::ResourceQueue;
pub use weak_list::WeakList;
