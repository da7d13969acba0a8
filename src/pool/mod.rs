//! GPU buffer pooling.
//!
//! - [`buckets`]: size class tables and lookup
//! - [`BucketedBufferPool`]: fence-aware recycling of bucket-sized buffers
//! - [`policy`]: the bone, cloth and skin cache pool flavors

pub mod buckets;
mod bucketed;
pub mod policy;

pub use bucketed::{BucketedBufferPool, PoolStats, PooledBuffer};
pub use buckets::{BucketTable, SHARED_POOL_BUCKETS, SKIN_CACHE_BUCKETS};
pub use policy::{
    BoneBufferPool, BonePoolPolicy, ClothBufferPool, ClothPoolPolicy, PoolPolicy,
    SkinCacheBufferPool, SkinCachePoolPolicy,
};
