use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use sysinfo::System;

use crate::cache::adaptive_compute_cache::AdaptiveComputeCache;
use crate::shared::constants::{
    BUDGET_STEP_FRACTION, DEFAULT_CACHE_CEILING, DEFAULT_CACHE_FLOOR, MEMORY_HIGH_WATERMARK,
    MEMORY_LOW_WATERMARK,
};

/// Watermark policy for resizing a cache budget from system memory utilization.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BudgetPolicy {
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub step_fraction: f64,
    pub floor: usize,
    pub ceiling: usize,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            high_watermark: MEMORY_HIGH_WATERMARK,
            low_watermark: MEMORY_LOW_WATERMARK,
            step_fraction: BUDGET_STEP_FRACTION,
            floor: DEFAULT_CACHE_FLOOR,
            ceiling: DEFAULT_CACHE_CEILING,
        }
    }
}

impl BudgetPolicy {
    /// Budget to apply given the current budget and a utilization in `0.0..=1.0`.
    pub fn next_budget(&self, current: usize, utilization: f64) -> usize {
        let step = (current as f64 * self.step_fraction) as usize;
        let next = if utilization > self.high_watermark {
            current.saturating_sub(step)
        } else if utilization < self.low_watermark {
            current.saturating_add(step)
        } else {
            current
        };
        next.clamp(self.floor, self.ceiling.max(self.floor))
    }
}

pub trait MemoryGauge: Send {
    /// Fraction of system memory in use, or `None` when unknown.
    fn utilization(&mut self) -> Option<f64>;
}

pub struct SystemMemoryGauge {
    system: System,
}

impl Default for SystemMemoryGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemoryGauge {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl MemoryGauge for SystemMemoryGauge {
    fn utilization(&mut self) -> Option<f64> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return None;
        }
        Some(self.system.used_memory() as f64 / total as f64)
    }
}

/// Anything whose byte budget can be adjusted at runtime.
pub trait ResizableCache: Send + Sync {
    fn max_bytes(&self) -> usize;
    /// Returns the budget actually applied.
    fn set_max_bytes(&self, max_bytes: usize) -> usize;
}

impl ResizableCache for AdaptiveComputeCache {
    fn max_bytes(&self) -> usize {
        AdaptiveComputeCache::max_bytes(self)
    }

    fn set_max_bytes(&self, max_bytes: usize) -> usize {
        AdaptiveComputeCache::set_max_bytes(self, max_bytes)
    }
}

/// Background thread that samples memory utilization and resizes a cache.
/// Dropping the monitor stops and joins the thread.
pub struct ResourceMonitor {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ResourceMonitor {
    pub fn spawn(
        cache: Arc<dyn ResizableCache>,
        mut gauge: Box<dyn MemoryGauge>,
        policy: BudgetPolicy,
        interval: Duration,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("resource-monitor".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let Some(utilization) = gauge.utilization() else {
                    continue;
                };
                let current = cache.max_bytes();
                let next = policy.next_budget(current, utilization);
                if next != current {
                    let applied = cache.set_max_bytes(next);
                    log::info!(
                        "Memory at {:.0}%: cache budget {} -> {} bytes",
                        utilization * 100.0,
                        current,
                        applied
                    );
                }
            })?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
