//! Pool policies.
//!
//! A policy fixes what a [`BucketedBufferPool`](super::BucketedBufferPool)
//! hands out: the device label, the usage flags, and the bucket table.

use super::buckets::{BucketTable, SHARED_POOL_BUCKETS, SKIN_CACHE_BUCKETS};
use super::bucketed::BucketedBufferPool;
use crate::device::BufferUsage;

pub trait PoolPolicy {
    const LABEL: &'static str;
    const USAGE: BufferUsage;

    fn buckets() -> BucketTable;
}

/// Bone matrix storage (3x4 matrices, uploaded every revision).
#[derive(Debug, Clone, Copy, Default)]
pub struct BonePoolPolicy;

impl PoolPolicy for BonePoolPolicy {
    const LABEL: &'static str = "Bone Matrices";
    const USAGE: BufferUsage = BufferUsage::STORAGE.union(BufferUsage::COPY_DST);

    fn buckets() -> BucketTable {
        SHARED_POOL_BUCKETS
    }
}

/// Cloth simulation positions and normals.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClothPoolPolicy;

impl PoolPolicy for ClothPoolPolicy {
    const LABEL: &'static str = "Cloth Simulation";
    const USAGE: BufferUsage = BufferUsage::STORAGE.union(BufferUsage::COPY_DST);

    fn buckets() -> BucketTable {
        SHARED_POOL_BUCKETS
    }
}

/// Skin cache outputs and tangent scratch buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkinCachePoolPolicy;

impl PoolPolicy for SkinCachePoolPolicy {
    const LABEL: &'static str = "Skin Cache Output";
    const USAGE: BufferUsage = BufferUsage::STORAGE
        .union(BufferUsage::VERTEX)
        .union(BufferUsage::COPY_DST);

    fn buckets() -> BucketTable {
        SKIN_CACHE_BUCKETS
    }
}

pub type BoneBufferPool = BucketedBufferPool<BonePoolPolicy>;
pub type ClothBufferPool = BucketedBufferPool<ClothPoolPolicy>;
pub type SkinCacheBufferPool = BucketedBufferPool<SkinCachePoolPolicy>;
