//! Incremental static regeneration cache.
//!
//! - **Store**: two-tier response store. A byte-budgeted LRU in memory backed
//!   by one file per key on disk, scoped to a build generation.
//! - **Handler**: serves requests from the store, classifying entries as
//!   fresh, stale or expired from their `s-maxage` and
//!   `stale-while-revalidate` windows, and coalescing renders per key.
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `isr-cache.toml`:
//!
//! ```toml
//! [cache]
//! root_dir = ".isr-cache"
//! generation = "build-42"
//! max_bytes = 52428800
//! # ... see config.rs for all options
//! ```

mod clock;
mod codec;
mod config;
mod expire;
mod handler;
mod lock;
mod lru;
mod middleware;
mod policy;
mod store;
mod vacuum;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{CacheEntry, CodecError, decode, encode};
pub use config::CacheConfig;
pub use expire::Expirer;
pub use handler::{HandlerConfig, IsrHandler, Origin, OriginError};
pub use lru::{ByteLru, Insert};
pub use middleware::{IsrState, cache_key, isr_layer};
pub use policy::{
    CACHE_STATUS_HEADER, CacheControl, CacheState, CacheStatus, Freshness, apply_image_override,
};
pub use store::{CacheStore, StoreError, StoreStats, hash_key};
pub use vacuum::{GenerationManifest, MANIFEST_FILE, VacuumReport, is_safe_generation, vacuum};
