//! Pagefront page cache.
//!
//! Full-page HTTP response caching in front of an application:
//!
//! - **Keys**: request identity plus application-registered vary dimensions
//! - **Admission**: pages are cached after `min_hits` requests per window
//! - **Regeneration lock**: one regenerator per URL after an invalidation
//! - **Capture**: generated responses are snapshotted into entries
//! - **Hits**: conditional 304 handling and redirect replay
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `pagefront.toml`:
//!
//! ```toml
//! [cache]
//! max_age_seconds = 600
//! min_hits = 2
//! window_seconds = 120
//! # ... see config.rs for all options
//! ```

mod admission;
mod annotate;
mod capture;
mod conditional;
mod config;
mod context;
mod engine;
mod entry;
mod genlock;
mod keys;
mod middleware;
mod redirect;
mod store;
mod vary;

pub use admission::{Admission, AdmissionController};
pub use capture::{GeneratedResponse, SkipReason};
pub use conditional::{Conditional, http_date};
pub use config::{CacheConfig, MAX_AGE_CEILING_SECONDS};
pub use context::{BypassReason, RequestContext};
pub use engine::{
    CachedResponse, Decision, Invalidation, PageCache, PageCacheBuilder, PendingCapture,
};
pub use entry::{CacheEntry, HeaderSet};
pub use genlock::RegenerationLock;
pub use keys::{CacheKey, UrlKey};
pub use middleware::{PageCacheState, page_cache_layer};
pub use redirect::{RedirectResponse, reason_phrase};
pub use store::{EntryStore, Namespace, Store, StoreError};
pub use vary::{
    Capability, RequestView, ResolvedVary, VaryDimensionSet, VaryError, VaryFunction, VaryRegistry,
    VaryValue,
};
