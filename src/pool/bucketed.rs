//! Bucketed Buffer Pool
//!
//! Recycles GPU buffers by size class. Every request is rounded up to a
//! bucket, so buffers of one bucket are interchangeable and never resized.
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                BucketedBufferPool<P>                     │
//! │                                                          │
//! │  free[bucket]: [FreeBuffer]        ◄── release()         │
//! │  pending:      [(FenceId, buf)]    ◄── release_after()   │
//! │                                                          │
//! │  acquire(size) → reclaim signaled pending                │
//! │                → pop free[bucket] or create on device    │
//! │  trim(n)       → destroy buffers idle for > n frames     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`PooledBuffer`] is not `Clone`: it has exactly one owner at a time and
//! release consumes it, so double release cannot be expressed. Releasing into
//! a pool other than the one that created the buffer panics.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use super::buckets::BucketTable;
use super::policy::PoolPolicy;
use crate::device::{BufferDesc, BufferHandle, FenceId, SkinDevice};
use crate::errors::{Result, SkinError};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

// ─── Public Types ─────────────────────────────────────────────────────────────

/// A device buffer owned through a pool.
#[derive(Debug, PartialEq, Eq)]
pub struct PooledBuffer {
    handle: BufferHandle,
    bucket: usize,
    size: u64,
    pool_id: u32,
}

impl PooledBuffer {
    #[inline]
    #[must_use]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    #[inline]
    #[must_use]
    pub fn bucket(&self) -> usize {
        self.bucket
    }

    /// Allocated size in bytes (the bucket size, not the requested size).
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated_bytes: u64,
    pub free_bytes: u64,
    pub in_use_count: usize,
    pub pending_count: usize,
    pub created_count: u64,
}

// ─── Internal Types ───────────────────────────────────────────────────────────

struct FreeBuffer {
    buffer: PooledBuffer,
    idle_frames: u32,
}

struct PendingBuffer {
    buffer: PooledBuffer,
    fence: FenceId,
}

// ─── Pool Implementation ──────────────────────────────────────────────────────

pub struct BucketedBufferPool<P: PoolPolicy> {
    id: u32,
    free: Vec<Vec<FreeBuffer>>,
    pending: Vec<PendingBuffer>,
    allocated_bytes: u64,
    in_use: usize,
    created: u64,
    _policy: PhantomData<P>,
}

impl<P: PoolPolicy> BucketedBufferPool<P> {
    #[must_use]
    pub fn new() -> Self {
        let buckets = P::buckets();
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            free: (0..buckets.len()).map(|_| Vec::new()).collect(),
            pending: Vec::new(),
            allocated_bytes: 0,
            in_use: 0,
            created: 0,
            _policy: PhantomData,
        }
    }

    #[must_use]
    pub fn buckets(&self) -> BucketTable {
        P::buckets()
    }

    /// Size actually allocated for a request of `size` bytes.
    #[must_use]
    pub fn pooled_size(size: u64) -> Option<u64> {
        P::buckets().pooled_size(size)
    }

    // ── Acquire / release ──────────────────────────────────────────────────

    /// Hands out a buffer of at least `size` bytes.
    ///
    /// Signaled pending buffers are reclaimed first so a buffer released with
    /// an already completed fence is reused instead of allocating.
    pub fn acquire(&mut self, device: &dyn SkinDevice, size: u64) -> Result<PooledBuffer> {
        self.reclaim(device);

        let buckets = P::buckets();
        let Some(bucket) = buckets.bucket_index(size) else {
            return Err(SkinError::exhausted(
                P::LABEL,
                size,
                format!("request exceeds largest bucket ({} bytes)", buckets.largest()),
            ));
        };

        if let Some(free) = self.free[bucket].pop() {
            self.in_use += 1;
            return Ok(free.buffer);
        }

        let bucket_size = buckets.bucket_size(bucket);
        let handle = device.create_buffer(&BufferDesc {
            label: P::LABEL,
            size: bucket_size,
            usage: P::USAGE,
        })?;

        self.allocated_bytes += bucket_size;
        self.created += 1;
        self.in_use += 1;
        log::info!(
            "{} pool grew: +{} bytes (bucket {}), total {} bytes",
            P::LABEL,
            bucket_size,
            bucket,
            self.allocated_bytes
        );

        Ok(PooledBuffer {
            handle,
            bucket,
            size: bucket_size,
            pool_id: self.id,
        })
    }

    /// Returns a buffer the GPU is known to be done with.
    pub fn release(&mut self, buffer: PooledBuffer) {
        self.check_owner(&buffer);
        self.in_use -= 1;
        let bucket = buffer.bucket;
        self.free[bucket].push(FreeBuffer {
            buffer,
            idle_frames: 0,
        });
    }

    /// Returns a buffer once `fence` signals.
    pub fn release_after(&mut self, buffer: PooledBuffer, fence: FenceId) {
        self.check_owner(&buffer);
        self.in_use -= 1;
        self.pending.push(PendingBuffer { buffer, fence });
    }

    /// Moves every pending buffer whose fence signaled to its free list.
    pub fn reclaim(&mut self, device: &dyn SkinDevice) {
        if self.pending.is_empty() {
            return;
        }
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| device.is_fence_signaled(p.fence));
        self.pending = pending;
        for p in ready {
            let bucket = p.buffer.bucket;
            self.free[bucket].push(FreeBuffer {
                buffer: p.buffer,
                idle_frames: 0,
            });
        }
    }

    fn check_owner(&self, buffer: &PooledBuffer) {
        assert_eq!(
            buffer.pool_id,
            self.id,
            "{}: buffer {:?} released into a pool that did not create it",
            P::LABEL,
            buffer.handle
        );
    }

    // ── Frame boundary ─────────────────────────────────────────────────────

    /// Ages free buffers and destroys those idle for more than `max_idle_frames`.
    pub fn trim(&mut self, device: &dyn SkinDevice, max_idle_frames: u32) {
        self.reclaim(device);

        let mut freed = 0u64;
        for bucket in &mut self.free {
            for f in bucket.iter_mut() {
                f.idle_frames += 1;
            }
            bucket.retain(|f| {
                if f.idle_frames > max_idle_frames {
                    device.destroy_buffer(f.buffer.handle);
                    freed += f.buffer.size;
                    false
                } else {
                    true
                }
            });
        }

        if freed > 0 {
            self.allocated_bytes -= freed;
            log::debug!(
                "{} pool trimmed {} bytes, {} bytes remain",
                P::LABEL,
                freed,
                self.allocated_bytes
            );
        }
    }

    /// Destroys every buffer the pool holds, waiting for pending fences.
    ///
    /// Buffers still handed out are not touched.
    pub fn destroy_all(&mut self, device: &dyn SkinDevice) {
        for p in std::mem::take(&mut self.pending) {
            device.wait_fence(p.fence);
            device.destroy_buffer(p.buffer.handle);
            self.allocated_bytes -= p.buffer.size;
        }
        for bucket in &mut self.free {
            for f in bucket.drain(..) {
                device.destroy_buffer(f.buffer.handle);
                self.allocated_bytes -= f.buffer.size;
            }
        }
    }

    // ── Stats ──────────────────────────────────────────────────────────────

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated_bytes: self.allocated_bytes,
            free_bytes: self.free_bytes(),
            in_use_count: self.in_use,
            pending_count: self.pending.len(),
            created_count: self.created,
        }
    }

    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free
            .iter()
            .flat_map(|b| b.iter())
            .map(|f| f.buffer.size)
            .sum()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.in_use
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True if `handle` is waiting on a fence in this pool.
    #[must_use]
    pub fn is_pending(&self, handle: BufferHandle) -> bool {
        self.pending.iter().any(|p| p.buffer.handle == handle)
    }
}

impl<P: PoolPolicy> Default for BucketedBufferPool<P> {
    fn default() -> Self {
        Self::new()
    }
}
