//! Batching of morph work items into dispatches.
//!
//! Each dispatch covers up to `batch_size` items (morph targets for the
//! update pass, permutations for the normalize pass). One thread runs per
//! delta (or per permutation vertex); a prefix sum of item sizes lets each
//! thread find its item with a binary search.

use smallvec::SmallVec;

use crate::settings::MORPH_BATCH_TABLE_CAPACITY;

/// Threads per morph workgroup.
pub const MORPH_WORKGROUP_SIZE: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchBatch {
    /// Indices of the items in this batch, in input order.
    pub items: SmallVec<[u32; 16]>,
    /// First thread of each item; one extra trailing entry holds the total.
    pub thread_offsets: SmallVec<[u32; 16]>,
}

impl DispatchBatch {
    #[must_use]
    pub fn total_threads(&self) -> u32 {
        self.thread_offsets.last().copied().unwrap_or(0)
    }

    #[must_use]
    pub fn workgroups(&self) -> u32 {
        self.total_threads().div_ceil(MORPH_WORKGROUP_SIZE)
    }
}

/// Splits `(item index, thread count)` pairs into batches of at most
/// `batch_size` items. Items with no threads are skipped, as are empty batches.
#[must_use]
pub fn plan_batches(items: &[(u32, u32)], batch_size: usize) -> Vec<DispatchBatch> {
    let batch_size = batch_size.clamp(1, MORPH_BATCH_TABLE_CAPACITY - 1);
    let mut batches = Vec::new();

    for chunk in items
        .iter()
        .filter(|(_, threads)| *threads > 0)
        .collect::<Vec<_>>()
        .chunks(batch_size)
    {
        let mut batch = DispatchBatch {
            items: SmallVec::with_capacity(chunk.len()),
            thread_offsets: SmallVec::with_capacity(chunk.len() + 1),
        };
        let mut total = 0u32;
        for (item, threads) in chunk {
            batch.items.push(*item);
            batch.thread_offsets.push(total);
            total += threads;
        }
        batch.thread_offsets.push(total);
        batches.push(batch);
    }
    batches
}
