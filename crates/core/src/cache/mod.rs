pub mod adaptive_compute_cache;
pub mod fingerprint;
mod mapped_store;
pub mod resource_monitor;

pub use adaptive_compute_cache::{
    AdaptiveComputeCache, CacheConfig, CacheError, CacheStats, CacheValue,
};
pub use fingerprint::{Fingerprint, FingerprintBuilder};
pub use resource_monitor::{
    BudgetPolicy, MemoryGauge, ResizableCache, ResourceMonitor, SystemMemoryGauge,
};
