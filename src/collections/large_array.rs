use crate::collections::bit_array::BitArray;

// Chunked growth keeps expansion to one new chunk at a time instead of
// reallocating and copying the whole backing store.
const CHUNK_SHIFT: usize = 10;
const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;
const CHUNK_MASK: usize = CHUNK_SIZE - 1;

/// Jagged array: a vector of fixed-size chunks addressed as one flat index
/// space. Capacity only ever grows.
pub struct LargeArray<T> {
    chunks: Vec<Vec<T>>,
    capacity: usize,
}

impl<T: Default> LargeArray<T> {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            capacity: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Grows until at least `min_capacity` slots exist, default-filled.
    pub fn ensure_capacity(&mut self, min_capacity: usize) {
        while self.capacity < min_capacity {
            let mut chunk = Vec::with_capacity(CHUNK_SIZE);
            chunk.resize_with(CHUNK_SIZE, T::default);
            self.chunks.push(chunk);
            self.capacity += CHUNK_SIZE;
        }
    }

    pub fn get(&self, index: usize) -> &T {
        assert!(index < self.capacity, "index out of range");
        &self.chunks[index >> CHUNK_SHIFT][index & CHUNK_MASK]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut T {
        assert!(index < self.capacity, "index out of range");
        &mut self.chunks[index >> CHUNK_SHIFT][index & CHUNK_MASK]
    }

    pub fn set(&mut self, index: usize, value: T) -> T {
        assert!(index < self.capacity, "index out of range");
        std::mem::replace(self.get_mut(index), value)
    }
}

impl<T: Default> Default for LargeArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sparse indexed container: an is-present bitmap layered over a jagged
/// array. `add` reuses the lowest free slot, expanding when none is free.
pub struct NullableLargeArray<T> {
    present: BitArray,
    items: LargeArray<Option<T>>,
}

impl<T> NullableLargeArray<T> {
    pub fn new() -> Self {
        Self {
            present: BitArray::new(0, false),
            items: LargeArray::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.present.count_set_bits()
    }

    /// Stores `value` in the first free slot and returns its index.
    pub fn add(&mut self, value: T) -> usize {
        let index = match self.present.find_first_cleared() {
            Some(index) => index,
            None => {
                let index = self.present.len();
                self.present.grow(index + 1);
                index
            }
        };
        self.items.ensure_capacity(index + 1);
        self.present.set(index);
        self.items.set(index, Some(value));
        index
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.present.len() || !self.present.get(index) {
            return None;
        }
        self.items.get(index).as_ref()
    }

    /// Stores `value` at a caller-chosen index, growing as needed.
    /// Returns the previous occupant, if any.
    pub fn set_value(&mut self, index: usize, value: T) -> Option<T> {
        if index >= self.present.len() {
            self.present.grow(index + 1);
        }
        self.items.ensure_capacity(index + 1);
        self.present.set(index);
        self.items.set(index, Some(value))
    }

    /// Clears the slot, returning the removed value if it was present.
    pub fn set_null(&mut self, index: usize) -> Option<T> {
        if index >= self.present.len() || !self.present.clear(index) {
            return None;
        }
        self.items.set(index, None)
    }

    /// Present elements in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        (0..self.present.len()).filter_map(|index| {
            if self.present.get(index) {
                self.items.get(index).as_ref().map(|item| (index, item))
            } else {
                None
            }
        })
    }
}

impl<T> Default for NullableLargeArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_array_chunked_growth() {
        let mut array: LargeArray<u64> = LargeArray::new();
        array.ensure_capacity(CHUNK_SIZE + 1);
        assert_eq!(array.capacity(), 2 * CHUNK_SIZE);
        array.set(CHUNK_SIZE, 7);
        assert_eq!(*array.get(CHUNK_SIZE), 7);
        assert_eq!(*array.get(0), 0);
    }

    #[test]
    fn test_nullable_add_reuses_freed_slot() {
        let mut array = NullableLargeArray::new();
        let a = array.add("a");
        let b = array.add("b");
        let c = array.add("c");
        assert_eq!((a, b, c), (0, 1, 2));

        assert_eq!(array.set_null(b), Some("b"));
        assert_eq!(array.count(), 2);
        assert_eq!(array.add("d"), b);
        assert_eq!(array.get(b), Some(&"d"));
    }

    #[test]
    fn test_nullable_iter_in_index_order() {
        let mut array = NullableLargeArray::new();
        for value in 0..5u32 {
            array.add(value);
        }
        array.set_null(1);
        array.set_null(3);

        let seen: Vec<_> = array.iter().collect();
        assert_eq!(seen, vec![(0, &0), (2, &2), (4, &4)]);
    }

    #[test]
    fn test_nullable_set_value_at_index() {
        let mut array = NullableLargeArray::new();
        assert_eq!(array.set_value(5, "x"), None);
        assert_eq!(array.get(5), Some(&"x"));
        assert_eq!(array.set_value(5, "y"), Some("x"));
        assert_eq!(array.count(), 1);
        // add() still fills the lowest free slot.
        assert_eq!(array.add("z"), 0);
    }

    #[test]
    fn test_nullable_set_null_twice() {
        let mut array = NullableLargeArray::new();
        let index = array.add(42u64);
        assert_eq!(array.set_null(index), Some(42));
        assert_eq!(array.set_null(index), None);
        assert_eq!(array.get(index), None);
    }
}
