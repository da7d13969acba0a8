//! Buffer size buckets.
//!
//! A bucket table is a fixed ascending list of byte sizes. A request of `n`
//! bytes is served by the smallest bucket `>= n`, found by binary search.
//! Tables are process-wide constants, so the mapping is deterministic.

/// Bone and cloth buffers.
pub const SHARED_POOL_BUCKET_SIZES: [u64; 17] = [
    16, 48, 96, 192, 384, 768, 1536, 3072, 4608, 6144, 7680, 9216, 12288, 65536, 131_072,
    262_144, 1_048_576,
];

/// Skin cache outputs: powers of two from 4 KiB to 256 MiB.
pub const SKIN_CACHE_BUCKET_SIZES: [u64; 17] = [
    1 << 12,
    1 << 13,
    1 << 14,
    1 << 15,
    1 << 16,
    1 << 17,
    1 << 18,
    1 << 19,
    1 << 20,
    1 << 21,
    1 << 22,
    1 << 23,
    1 << 24,
    1 << 25,
    1 << 26,
    1 << 27,
    1 << 28,
];

pub const SHARED_POOL_BUCKETS: BucketTable = BucketTable::new(&SHARED_POOL_BUCKET_SIZES);
pub const SKIN_CACHE_BUCKETS: BucketTable = BucketTable::new(&SKIN_CACHE_BUCKET_SIZES);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketTable {
    sizes: &'static [u64],
}

impl BucketTable {
    /// `sizes` must be non-empty and strictly ascending.
    #[must_use]
    pub const fn new(sizes: &'static [u64]) -> Self {
        Self { sizes }
    }

    /// Index of the smallest bucket holding `size` bytes, `None` if `size`
    /// exceeds the largest bucket.
    #[must_use]
    pub fn bucket_index(&self, size: u64) -> Option<usize> {
        let index = self.sizes.partition_point(|&bucket| bucket < size);
        (index < self.sizes.len()).then_some(index)
    }

    #[must_use]
    pub fn bucket_size(&self, index: usize) -> u64 {
        self.sizes[index]
    }

    /// Byte size actually allocated for a request of `size` bytes.
    #[must_use]
    pub fn pooled_size(&self, size: u64) -> Option<u64> {
        self.bucket_index(size).map(|i| self.sizes[i])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    #[must_use]
    pub fn largest(&self) -> u64 {
        self.sizes.last().copied().unwrap_or(0)
    }

    #[must_use]
    pub fn sizes(&self) -> &'static [u64] {
        self.sizes
    }
}
