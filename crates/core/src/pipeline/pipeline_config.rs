use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::infrastructure::backend_host::HostConfig;
use crate::backend::infrastructure::backend_worker::WorkerConfig;
use crate::cache::CacheConfig;
use crate::shared::constants::{
    DEFAULT_BACKOFF_MS, DEFAULT_CACHE_BUDGET, DEFAULT_CACHE_CEILING, DEFAULT_CONNECTION_CAPACITY,
    DEFAULT_HEAP_CAPACITY, DEFAULT_JOIN_TIMEOUT_MS, DEFAULT_MAPPED_THRESHOLD,
    DEFAULT_READ_TIMEOUT_MS, DEFAULT_SOURCE_FPS,
};
use crate::stages::infrastructure::stage_cache::StageCacheConfig;

/// Which stage produces the replacement face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    FaceSwap,
    FaceAnimator,
}

impl PipelineMode {
    pub const ALL: &'static [PipelineMode] = &[PipelineMode::FaceSwap, PipelineMode::FaceAnimator];
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMode::FaceSwap => write!(f, "face_swap"),
            PipelineMode::FaceAnimator => write!(f, "face_animator"),
        }
    }
}

impl std::str::FromStr for PipelineMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "face_swap" => Ok(PipelineMode::FaceSwap),
            "face_animator" => Ok(PipelineMode::FaceAnimator),
            other => Err(format!("unknown pipeline mode {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub heap_capacity: usize,
    pub cache_budget: usize,
    pub cache_ceiling: usize,
    pub mapped_threshold: usize,
    pub cache_spill_dir: Option<PathBuf>,
    /// Resize cache budgets from system memory pressure.
    pub resource_monitor: bool,
    /// Records a connection buffers; 1 or 2.
    pub connection_capacity: usize,
    pub read_timeout_ms: u64,
    pub backoff_ms: u64,
    pub join_timeout_ms: u64,
    pub auto_restart: bool,
    pub timing_logs: bool,
    pub mode: PipelineMode,
    pub source_fps: f64,
    pub backend_db_path: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    /// Where the swapper fetches its reference face when the model directory
    /// has none.
    pub reference_face_url: Option<String>,
    /// Expose records leaving the output stage on [`FaceSwapPipeline::output`].
    /// Someone must drain it, or the pipeline stalls under backpressure.
    ///
    /// [`FaceSwapPipeline::output`]: crate::pipeline::face_swap_pipeline::FaceSwapPipeline::output
    pub forward_output: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            heap_capacity: DEFAULT_HEAP_CAPACITY,
            cache_budget: DEFAULT_CACHE_BUDGET,
            cache_ceiling: DEFAULT_CACHE_CEILING,
            mapped_threshold: DEFAULT_MAPPED_THRESHOLD,
            cache_spill_dir: None,
            resource_monitor: true,
            connection_capacity: DEFAULT_CONNECTION_CAPACITY,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            backoff_ms: DEFAULT_BACKOFF_MS,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            auto_restart: false,
            timing_logs: false,
            mode: PipelineMode::FaceSwap,
            source_fps: DEFAULT_SOURCE_FPS,
            backend_db_path: None,
            model_dir: None,
            reference_face_url: None,
            forward_output: false,
        }
    }
}

impl PipelineConfig {
    /// Reads a JSON config. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let json = fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| format!("invalid config {}: {e}", path.display()))?;
        Ok(config.normalized())
    }

    /// Clamps values into their supported ranges.
    pub fn normalized(mut self) -> Self {
        self.connection_capacity = self.connection_capacity.clamp(1, 2);
        self.cache_ceiling = self.cache_ceiling.max(self.cache_budget);
        self.source_fps = self.source_fps.clamp(1.0, 240.0);
        self
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            worker: WorkerConfig {
                read_timeout: Duration::from_millis(self.read_timeout_ms),
                backoff: Duration::from_millis(self.backoff_ms),
                timing_logs: self.timing_logs,
            },
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            auto_restart: self.auto_restart,
        }
    }

    pub fn stage_cache_config(&self) -> StageCacheConfig {
        StageCacheConfig {
            cache: CacheConfig {
                max_bytes: self.cache_budget,
                ceiling: self.cache_ceiling,
                mapped_threshold: self.mapped_threshold,
                spill_dir: self.cache_spill_dir.clone(),
            },
            monitor: self.resource_monitor,
        }
    }
}
