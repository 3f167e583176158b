//! normcache engine
//!
//! Algorithms of the normalized cache built on `normcache-core` and
//! `normcache-storage`:
//!
//! - [`normalizer`]: response tree to flat records
//! - [`resolver`]: per-field resolution with freshness checks
//! - [`reader`]: breadth-first batched reads with null propagation
//! - [`gc`]: stale, dangling and unreachable sweeps
//! - [`store`]: the facade tying them to a storage and a change bus

pub mod gc;
pub mod normalizer;
pub mod policies;
pub mod reader;
pub mod resolver;
pub mod store;

pub use gc::{
    cascade_removed, garbage_collect, reachable_keys, remove_dangling_references,
    remove_stale_fields, remove_unreachable_records, GarbageCollectResult,
    RemovedFieldsAndRecords,
};
pub use normalizer::{normalize, NormalizeOptions, ResponseError};
pub use policies::{CachePolicies, CachePoliciesBuilder};
pub use reader::{
    to_response, BatchReader, BatchReaderData, ObjectSlot, ReadRequest, ReadResult,
};
pub use resolver::{
    staleness, CacheControlCacheResolver, CacheResolver, DefaultCacheResolver,
    FieldPolicyCacheResolver, ResolvedValue, ResolverContext, Staleness,
};
pub use store::{NormalizedStore, ReadOptions};

// Re-export the layers below for single-crate consumers.
pub use normcache_core as core;
pub use normcache_storage as storage;
