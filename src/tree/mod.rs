pub mod builder;
pub mod encoding;
pub mod filters;
pub mod merge;
pub mod node;
pub mod scanner;
pub mod writer;

pub use builder::{SequentialTreeBuilder, SortingTreeBuilder};
pub use encoding::{
    standard_u64_library, DeltaPointEncoding, EncodingLibrary, FixedKey, FixedSizeEncoding,
    FixedValue, PairEncoding, DELTA_U64_ENCODING_ID, FIXED_SIZE_ENCODING_ID,
};
pub use filters::{
    best_point_id_filter, AccessControlledSeekFilter, KeyRangeSeekFilter, MatchFilter,
    PointIdBitArray, SeekFilter, UIntHashSet, ULongHashSet,
};
pub use merge::UnionTreeStream;
pub use node::{NodeHeader, NODE_VERSION};
pub use scanner::TreeScanner;
pub use writer::TreeWriter;
