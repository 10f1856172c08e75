use std::sync::Arc;
use std::time::Duration;

use crate::backend::domain::control_sheet::ControlSheet;
use crate::cache::{
    AdaptiveComputeCache, BudgetPolicy, CacheConfig, CacheStats, CacheValue, Fingerprint,
    ResourceMonitor, SystemMemoryGauge,
};
use crate::shared::constants::{DEFAULT_CACHE_FLOOR, MIB, RESOURCE_MONITOR_INTERVAL_MS};

pub const CACHED_CELL: &str = "cached";
pub const CACHE_STATS_CELL: &str = "cache_stats";

/// How a stage builds its compute cache.
#[derive(Clone, Debug, PartialEq)]
pub struct StageCacheConfig {
    pub cache: CacheConfig,
    /// Resize the budget from system memory pressure.
    pub monitor: bool,
}

impl Default for StageCacheConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            monitor: true,
        }
    }
}

/// A stage's [`AdaptiveComputeCache`], its `cached` toggle and stats label.
///
/// The cache is created when the sheet is set up. If that fails the stage
/// runs uncached.
pub struct StageCache {
    config: StageCacheConfig,
    cache: Option<Arc<AdaptiveComputeCache>>,
    monitor: Option<ResourceMonitor>,
    enabled: bool,
    published: Option<CacheStats>,
}

impl StageCache {
    pub fn new(config: StageCacheConfig) -> Self {
        Self {
            config,
            cache: None,
            monitor: None,
            enabled: true,
            published: None,
        }
    }

    pub fn setup_sheet(&mut self, sheet: &mut ControlSheet) {
        if let Err(e) = sheet.add_flag(CACHED_CELL, true) {
            log::warn!("{e}");
        }
        if let Err(e) = sheet.add_info_label(CACHE_STATS_CELL) {
            log::warn!("{e}");
        }
        match AdaptiveComputeCache::new(self.config.cache.clone()) {
            Ok(cache) => {
                let cache = Arc::new(cache);
                if self.config.monitor {
                    let policy = BudgetPolicy {
                        floor: DEFAULT_CACHE_FLOOR.min(self.config.cache.max_bytes),
                        ceiling: cache.ceiling(),
                        ..BudgetPolicy::default()
                    };
                    match ResourceMonitor::spawn(
                        cache.clone(),
                        Box::new(SystemMemoryGauge::new()),
                        policy,
                        Duration::from_millis(RESOURCE_MONITOR_INTERVAL_MS),
                    ) {
                        Ok(monitor) => self.monitor = Some(monitor),
                        Err(e) => log::warn!("Cache resource monitor unavailable: {e}"),
                    }
                }
                self.cache = Some(cache);
            }
            Err(e) => log::warn!("Running uncached: {e}"),
        }
    }

    /// Returns `true` when `cell` was the cache toggle.
    pub fn on_cell_changed(&mut self, cell: &str, sheet: &ControlSheet) -> bool {
        if cell != CACHED_CELL {
            return false;
        }
        self.enabled = sheet.flag(CACHED_CELL).unwrap_or(true);
        if !self.enabled {
            if let Some(cache) = &self.cache {
                cache.clear();
            }
        }
        true
    }

    /// Looks `fingerprint` up, or computes and stores the value. Bypassed
    /// when caching is off or unavailable.
    pub fn get_or_compute<V, E>(
        &self,
        fingerprint: Fingerprint,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E>
    where
        V: CacheValue,
    {
        match &self.cache {
            Some(cache) if self.enabled => cache.get_or_compute(fingerprint, compute),
            _ => compute(),
        }
    }

    pub fn stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    /// Refreshes the stats label when the numbers moved.
    pub fn publish(&mut self, sheet: &mut ControlSheet) {
        let Some(stats) = self.stats() else {
            return;
        };
        if self.published == Some(stats) {
            return;
        }
        self.published = Some(stats);
        let _ = sheet.set_info(CACHE_STATS_CELL, Some(format_stats(&stats)));
    }

    pub fn shutdown(&mut self) {
        self.monitor = None;
        if let Some(cache) = self.cache.take() {
            cache.clear();
        }
    }
}

pub fn format_stats(stats: &CacheStats) -> String {
    let mib = |b: usize| b as f64 / MIB as f64;
    format!(
        "hit rate {:.0}% ({} hits, {} misses), {:.1}/{:.1} MiB, {} entries ({} mapped), {} evictions",
        stats.hit_rate() * 100.0,
        stats.hits,
        stats.misses,
        mib(stats.current_bytes),
        mib(stats.max_bytes),
        stats.entries,
        stats.mapped_entries,
        stats.evictions
    )
}
