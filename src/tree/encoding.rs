use crate::error::{Result, SnapError};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use uuid::Uuid;

/// Fixed-width key type stored in a sorted tree. Bounds serialization uses
/// `SIZE` bytes at fixed node offsets, so the width is a type constant.
pub trait FixedKey: Ord + Clone + Debug + Default + Send + Sync + 'static {
    const SIZE: usize;
    fn type_id() -> Uuid;
    fn write_to(&self, buf: &mut [u8]);
    fn read_from(buf: &[u8]) -> Self;
    /// Smallest representable key; used for open lower bounds.
    fn lower_limit() -> Self;
    /// Largest representable key; used for open upper bounds.
    fn upper_limit() -> Self;
}

/// Fixed-width value type stored alongside keys.
pub trait FixedValue: Clone + Debug + Default + PartialEq + Send + Sync + 'static {
    const SIZE: usize;
    fn type_id() -> Uuid;
    fn write_to(&self, buf: &mut [u8]);
    fn read_from(buf: &[u8]) -> Self;
}

pub const U64_TYPE_ID: Uuid = Uuid::from_u128(0x5bd9_13cd_0ee1_4baa_9a2c_1f2e_51c0_0801);
pub const U32_TYPE_ID: Uuid = Uuid::from_u128(0x5bd9_13cd_0ee1_4baa_9a2c_1f2e_51c0_0802);

impl FixedKey for u64 {
    const SIZE: usize = 8;

    fn type_id() -> Uuid {
        U64_TYPE_ID
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        u64::from_le_bytes(buf[..8].try_into().unwrap())
    }

    fn lower_limit() -> Self {
        0
    }

    fn upper_limit() -> Self {
        u64::MAX
    }
}

impl FixedValue for u64 {
    const SIZE: usize = 8;

    fn type_id() -> Uuid {
        U64_TYPE_ID
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        u64::from_le_bytes(buf[..8].try_into().unwrap())
    }
}

impl FixedKey for u32 {
    const SIZE: usize = 4;

    fn type_id() -> Uuid {
        U32_TYPE_ID
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        u32::from_le_bytes(buf[..4].try_into().unwrap())
    }

    fn lower_limit() -> Self {
        0
    }

    fn upper_limit() -> Self {
        u32::MAX
    }
}

impl FixedValue for u32 {
    const SIZE: usize = 4;

    fn type_id() -> Uuid {
        U32_TYPE_ID
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        u32::from_le_bytes(buf[..4].try_into().unwrap())
    }
}

/// Per-pair serialization plugin. Encoders may reference the previous pair
/// (delta forms); `prev` is the zero/default pair at the start of every
/// node, so nodes stay independently decodable.
pub trait PairEncoding<K: FixedKey, V: FixedValue>: Send + Sync {
    fn id(&self) -> Uuid;

    /// Upper bound on one encoded record; sizes leaf free-space checks.
    fn max_record_size(&self) -> usize;

    /// True when the encoding carries its own end-of-stream symbol;
    /// otherwise framed streams wrap records with a one-byte prefix.
    fn contains_end_of_stream_symbol(&self) -> bool {
        false
    }

    /// Appends one record to `out`, returning the bytes written.
    fn encode(&self, out: &mut Vec<u8>, prev_key: &K, prev_value: &V, key: &K, value: &V)
        -> usize;

    /// Decodes one record, returning `(bytes_consumed, end_of_stream)`.
    /// Encodings without an end symbol always report `false`; record
    /// counts or framing delimit their streams.
    fn decode(
        &self,
        buf: &[u8],
        prev_key: &K,
        prev_value: &V,
        key: &mut K,
        value: &mut V,
    ) -> Result<(usize, bool)>;

    /// Framed form for stream consumers: prefix byte 1 announces a record.
    fn encode_framed(
        &self,
        out: &mut Vec<u8>,
        prev_key: &K,
        prev_value: &V,
        key: &K,
        value: &V,
    ) -> usize {
        if self.contains_end_of_stream_symbol() {
            return self.encode(out, prev_key, prev_value, key, value);
        }
        out.push(1);
        1 + self.encode(out, prev_key, prev_value, key, value)
    }

    /// Terminates a framed stream (prefix byte 0).
    fn encode_end_of_stream(&self, out: &mut Vec<u8>) {
        if !self.contains_end_of_stream_symbol() {
            out.push(0);
        }
    }

    /// Framed decode; `(consumed, true)` marks the end of the stream.
    fn decode_framed(
        &self,
        buf: &[u8],
        prev_key: &K,
        prev_value: &V,
        key: &mut K,
        value: &mut V,
    ) -> Result<(usize, bool)> {
        if self.contains_end_of_stream_symbol() {
            return self.decode(buf, prev_key, prev_value, key, value);
        }
        match buf.first() {
            Some(0) => Ok((1, true)),
            Some(1) => {
                let (consumed, _) = self.decode(&buf[1..], prev_key, prev_value, key, value)?;
                Ok((consumed + 1, false))
            }
            _ => Err(SnapError::Storage("bad stream framing byte".to_string())),
        }
    }
}

/// Well-known id of the mandatory fixed-size combined encoding.
pub const FIXED_SIZE_ENCODING_ID: Uuid = Uuid::from_u128(0x1dea_326d_a63a_4f73_b51c_7b3125c6da55);

/// Well-known id of the u64 delta varint encoding.
pub const DELTA_U64_ENCODING_ID: Uuid = Uuid::from_u128(0x4a14_5ca1_90f4_4a4b_8b12_f13e7ea5a7e2);

/// Raw key bytes followed by raw value bytes. Always available as the
/// default; every (key, value) pair type supports it.
pub struct FixedSizeEncoding<K, V> {
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K, V> FixedSizeEncoding<K, V> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<K, V> Default for FixedSizeEncoding<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: FixedKey, V: FixedValue> PairEncoding<K, V> for FixedSizeEncoding<K, V> {
    fn id(&self) -> Uuid {
        FIXED_SIZE_ENCODING_ID
    }

    fn max_record_size(&self) -> usize {
        K::SIZE + V::SIZE
    }

    fn encode(
        &self,
        out: &mut Vec<u8>,
        _prev_key: &K,
        _prev_value: &V,
        key: &K,
        value: &V,
    ) -> usize {
        let start = out.len();
        out.resize(start + K::SIZE + V::SIZE, 0);
        key.write_to(&mut out[start..]);
        value.write_to(&mut out[start + K::SIZE..]);
        K::SIZE + V::SIZE
    }

    fn decode(
        &self,
        buf: &[u8],
        _prev_key: &K,
        _prev_value: &V,
        key: &mut K,
        value: &mut V,
    ) -> Result<(usize, bool)> {
        if buf.len() < K::SIZE + V::SIZE {
            return Err(SnapError::Storage("truncated fixed-size record".to_string()));
        }
        *key = K::read_from(buf);
        *value = V::read_from(&buf[K::SIZE..]);
        Ok((K::SIZE + V::SIZE, false))
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) -> usize {
    let mut written = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        written += 1;
        if value == 0 {
            out.push(byte);
            return written;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            break;
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(SnapError::Storage("truncated varint".to_string()))
}

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Varint delta encoding for u64 pairs: the key advances monotonically
/// within a node so its delta is unsigned; the value delta is zigzagged.
/// Dense time-series keys encode in two or three bytes per record.
pub struct DeltaPointEncoding;

impl PairEncoding<u64, u64> for DeltaPointEncoding {
    fn id(&self) -> Uuid {
        DELTA_U64_ENCODING_ID
    }

    fn max_record_size(&self) -> usize {
        // Two worst-case 64-bit varints.
        20
    }

    fn encode(
        &self,
        out: &mut Vec<u8>,
        prev_key: &u64,
        prev_value: &u64,
        key: &u64,
        value: &u64,
    ) -> usize {
        debug_assert!(key >= prev_key, "keys must not regress within a node");
        let mut written = write_varint(out, key.wrapping_sub(*prev_key));
        written += write_varint(out, zigzag_encode(value.wrapping_sub(*prev_value) as i64));
        written
    }

    fn decode(
        &self,
        buf: &[u8],
        prev_key: &u64,
        prev_value: &u64,
        key: &mut u64,
        value: &mut u64,
    ) -> Result<(usize, bool)> {
        let (key_delta, a) = read_varint(buf)?;
        let (value_delta, b) = read_varint(&buf[a..])?;
        *key = prev_key.wrapping_add(key_delta);
        *value = prev_value.wrapping_add(zigzag_decode(value_delta) as u64);
        Ok((a + b, false))
    }
}

/// Encoding lookup by GUID for one (key, value) pair type. The fixed-size
/// combined encoding is always pre-registered.
pub struct EncodingLibrary<K: FixedKey, V: FixedValue> {
    encodings: HashMap<Uuid, Arc<dyn PairEncoding<K, V>>>,
}

impl<K: FixedKey, V: FixedValue> EncodingLibrary<K, V> {
    pub fn new() -> Self {
        let mut library = Self {
            encodings: HashMap::new(),
        };
        library.register(Arc::new(FixedSizeEncoding::<K, V>::new()));
        library
    }

    pub fn register(&mut self, encoding: Arc<dyn PairEncoding<K, V>>) {
        self.encodings.insert(encoding.id(), encoding);
    }

    pub fn resolve(&self, id: Uuid) -> Result<Arc<dyn PairEncoding<K, V>>> {
        self.encodings
            .get(&id)
            .cloned()
            .ok_or(SnapError::UnknownEncoding(id))
    }
}

impl<K: FixedKey, V: FixedValue> Default for EncodingLibrary<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The standard library for u64 points: fixed-size plus delta.
pub fn standard_u64_library() -> EncodingLibrary<u64, u64> {
    let mut library = EncodingLibrary::new();
    library.register(Arc::new(DeltaPointEncoding));
    library
}
