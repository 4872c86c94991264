use crate::error::{Result, SnapError};
use crate::storage::NIL_BLOCK;
use crate::tree::encoding::FixedKey;

pub const NODE_VERSION: u8 = 1;

// Fixed header offsets, little-endian, followed by the two bound keys.
const OFF_VERSION: usize = 0;
const OFF_LEVEL: usize = 1;
const OFF_RECORD_COUNT: usize = 2;
const OFF_VALID_BYTES: usize = 4;
const OFF_LEFT: usize = 6;
const OFF_RIGHT: usize = 10;
const OFF_LOWER: usize = 14;

/// Decoded node header. `level` 0 is a leaf; `valid_bytes` counts the
/// header plus encoded records, so `valid_bytes` never exceeds the block
/// body (trailer excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHeader<K: FixedKey> {
    pub level: u8,
    pub record_count: u16,
    pub valid_bytes: u16,
    pub left_sibling: u32,
    pub right_sibling: u32,
    pub lower_bound: K,
    pub upper_bound: K,
}

impl<K: FixedKey> NodeHeader<K> {
    /// Header bytes before the record area.
    pub const fn size() -> usize {
        OFF_LOWER + 2 * K::SIZE
    }

    pub fn new(level: u8) -> Self {
        Self {
            level,
            record_count: 0,
            valid_bytes: Self::size() as u16,
            left_sibling: NIL_BLOCK,
            right_sibling: NIL_BLOCK,
            lower_bound: K::lower_limit(),
            upper_bound: K::upper_limit(),
        }
    }

    pub fn read_from(body: &[u8]) -> Result<Self> {
        if body.len() < Self::size() {
            return Err(SnapError::Storage("block too small for a node".to_string()));
        }
        let version = body[OFF_VERSION];
        if version != NODE_VERSION {
            return Err(SnapError::Storage(format!(
                "unsupported node version {}",
                version
            )));
        }
        Ok(Self {
            level: body[OFF_LEVEL],
            record_count: u16::from_le_bytes(
                body[OFF_RECORD_COUNT..OFF_RECORD_COUNT + 2].try_into().unwrap(),
            ),
            valid_bytes: u16::from_le_bytes(
                body[OFF_VALID_BYTES..OFF_VALID_BYTES + 2].try_into().unwrap(),
            ),
            left_sibling: u32::from_le_bytes(body[OFF_LEFT..OFF_LEFT + 4].try_into().unwrap()),
            right_sibling: u32::from_le_bytes(body[OFF_RIGHT..OFF_RIGHT + 4].try_into().unwrap()),
            lower_bound: K::read_from(&body[OFF_LOWER..]),
            upper_bound: K::read_from(&body[OFF_LOWER + K::SIZE..]),
        })
    }

    pub fn write_to(&self, body: &mut [u8]) {
        body[OFF_VERSION] = NODE_VERSION;
        body[OFF_LEVEL] = self.level;
        body[OFF_RECORD_COUNT..OFF_RECORD_COUNT + 2]
            .copy_from_slice(&self.record_count.to_le_bytes());
        body[OFF_VALID_BYTES..OFF_VALID_BYTES + 2]
            .copy_from_slice(&self.valid_bytes.to_le_bytes());
        body[OFF_LEFT..OFF_LEFT + 4].copy_from_slice(&self.left_sibling.to_le_bytes());
        body[OFF_RIGHT..OFF_RIGHT + 4].copy_from_slice(&self.right_sibling.to_le_bytes());
        self.lower_bound.write_to(&mut body[OFF_LOWER..]);
        self.upper_bound.write_to(&mut body[OFF_LOWER + K::SIZE..]);
    }

    /// Rejects a node of the wrong family (leaf vs internal).
    pub fn expect_level(&self, level: u8) -> Result<()> {
        if self.level != level {
            return Err(SnapError::BlockTypeMismatch {
                expected: level,
                found: self.level,
            });
        }
        Ok(())
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// First record byte.
    pub fn records_start(&self) -> usize {
        Self::size()
    }

    /// One past the last record byte.
    pub fn records_end(&self) -> usize {
        self.valid_bytes as usize
    }
}

/// Internal-node record area: fixed-size `(separator, child)` entries,
/// key-ordered. Every key reachable through `child_i` is `>= separator_i`
/// and `< separator_(i+1)`.
pub mod internal {
    use super::*;

    pub const fn entry_size<K: FixedKey>() -> usize {
        K::SIZE + 4
    }

    pub fn capacity<K: FixedKey>(body_len: usize) -> usize {
        (body_len - NodeHeader::<K>::size()) / entry_size::<K>()
    }

    pub fn read_entry<K: FixedKey>(body: &[u8], index: usize) -> (K, u32) {
        let at = NodeHeader::<K>::size() + index * entry_size::<K>();
        let key = K::read_from(&body[at..]);
        let child = u32::from_le_bytes(body[at + K::SIZE..at + K::SIZE + 4].try_into().unwrap());
        (key, child)
    }

    pub fn write_entry<K: FixedKey>(body: &mut [u8], index: usize, key: &K, child: u32) {
        let at = NodeHeader::<K>::size() + index * entry_size::<K>();
        key.write_to(&mut body[at..]);
        body[at + K::SIZE..at + K::SIZE + 4].copy_from_slice(&child.to_le_bytes());
    }

    /// Entry index whose child covers `key`: the last separator `<= key`,
    /// clamped to the first entry for keys below every separator.
    pub fn search<K: FixedKey>(body: &[u8], record_count: u16, key: &K) -> usize {
        let mut low = 0usize;
        let mut high = record_count as usize;
        while low < high {
            let mid = (low + high) / 2;
            let (separator, _) = read_entry::<K>(body, mid);
            if separator <= *key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low.saturating_sub(1)
    }

    /// Shifts entries right and writes `(key, child)` at `index`.
    pub fn insert_entry<K: FixedKey>(
        body: &mut [u8],
        record_count: u16,
        index: usize,
        key: &K,
        child: u32,
    ) {
        let entry = entry_size::<K>();
        let start = NodeHeader::<K>::size() + index * entry;
        let end = NodeHeader::<K>::size() + record_count as usize * entry;
        body.copy_within(start..end, start + entry);
        write_entry(body, index, key, child);
    }
}
