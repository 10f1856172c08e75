use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use thiserror::Error;

use crate::backend::domain::control_sheet::{CellKind, CellValue};
use crate::backend::domain::stage_state::StageState;
use crate::backend::domain::stage_transform::StageTransform;
use crate::backend::infrastructure::backend_connection::BackendConnection;
use crate::backend::infrastructure::backend_db::{BackendDb, BackendDbError};
use crate::backend::infrastructure::backend_host::{BackendHost, HostError, TransformFactory};
use crate::backend::infrastructure::backend_signal::BackendSignal;
use crate::backend::infrastructure::backend_worker::WorkerLinks;
use crate::heap::{HeapStats, WeakHeap};
use crate::pipeline::pipeline_config::{PipelineConfig, PipelineMode};
use crate::shared::constants::{APP_DIR_NAME, BACKEND_DB_FILENAME};
use crate::shared::model_resolver;
use crate::stages::face_aligner::{self, FaceAligner};
use crate::stages::face_animator::{self, FaceAnimator};
use crate::stages::face_detector::{self, FaceDetector};
use crate::stages::face_marker::{self, FaceMarker};
use crate::stages::face_merger::{self, FaceMerger};
use crate::stages::face_swapper::{self, FaceSwapper};
use crate::stages::file_source::{self, FileSource, SourceOpener};
use crate::stages::frame_adjuster::{self, FrameAdjuster};
use crate::stages::infrastructure::model_slot::MODEL_PROGRESS_CELL;
use crate::stages::infrastructure::stage_cache::CACHE_STATS_CELL;
use crate::stages::stream_output::{self, SinkOpener, StreamOutput};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unknown stage {0}")]
    UnknownStage(String),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Db(#[from] BackendDbError),
}

/// What the GUI layer shows per stage.
#[derive(Clone, Debug, PartialEq)]
pub struct StageStatus {
    pub name: String,
    pub state: StageState,
    /// Whether the stage takes part in the current mode.
    pub active: bool,
    /// First error reported on the stage's sheet, if any.
    pub error: Option<String>,
    pub crash_count: u32,
    pub cache_stats: Option<String>,
    pub model_progress: Option<(u8, Option<String>)>,
}

/// The assembled face swap pipeline.
///
/// `sources -> face_detector -> face_marker -> face_aligner ->
/// {face_swapper | face_animator} -> frame_adjuster -> face_merger -> stream_output`
///
/// Owns one heap, one Backend DB, one signal and one uid counter shared by
/// every stage. The swapper and animator share their input and output
/// connections; only the one matching the current mode runs.
pub struct FaceSwapPipeline {
    hosts: Vec<BackendHost>,
    heap: Arc<WeakHeap>,
    db: Arc<BackendDb>,
    output: Option<BackendConnection>,
    mode: PipelineMode,
    started: bool,
}

impl FaceSwapPipeline {
    pub fn new(
        config: &PipelineConfig,
        sources: Vec<SourceOpener>,
        sink: Option<SinkOpener>,
    ) -> Self {
        let config = config.clone().normalized();
        let heap = Arc::new(WeakHeap::new(config.heap_capacity));
        let db = Arc::new(BackendDb::open(&backend_db_path(&config)));
        let signal = BackendSignal::new();
        let uids = Arc::new(AtomicU64::new(0));
        let model_dir = model_dir(&config);
        let host_config = config.host_config();
        let cache_config = config.stage_cache_config();

        let connection = || BackendConnection::new(config.connection_capacity);
        let sourced = connection();
        let detected = connection();
        let marked = connection();
        let aligned = connection();
        let faced = connection();
        let adjusted = connection();
        let merged = connection();
        let output = config.forward_output.then(connection);

        let links = |input: Option<&BackendConnection>, output: Option<&BackendConnection>| {
            WorkerLinks {
                heap: heap.clone(),
                input: input.cloned(),
                output: output.cloned(),
                signal: signal.clone(),
                uids: uids.clone(),
            }
        };
        let host = |name: &str, factory: TransformFactory, links: WorkerLinks| {
            BackendHost::new(name, factory, links, db.clone(), host_config)
        };

        let mut hosts = Vec::new();
        let source_count = sources.len();
        for (i, opener) in sources.into_iter().enumerate() {
            let name = if source_count == 1 {
                file_source::NAME.to_string()
            } else {
                format!("{}_{i}", file_source::NAME)
            };
            let fps = config.source_fps;
            hosts.push(host(
                &name,
                Box::new(move || {
                    Box::new(FileSource::new(opener.clone(), fps)) as Box<dyn StageTransform>
                }),
                links(None, Some(&sourced)),
            ));
        }

        let dir = model_dir.clone();
        let cache = cache_config.clone();
        hosts.push(host(
            face_detector::NAME,
            Box::new(move || {
                Box::new(FaceDetector::new(
                    face_detector::default_catalog(),
                    &dir,
                    cache.clone(),
                )) as Box<dyn StageTransform>
            }),
            links(Some(&sourced), Some(&detected)),
        ));

        let dir = model_dir.clone();
        hosts.push(host(
            face_marker::NAME,
            Box::new(move || {
                Box::new(FaceMarker::new(face_marker::default_catalog(), &dir))
                    as Box<dyn StageTransform>
            }),
            links(Some(&detected), Some(&marked)),
        ));

        hosts.push(host(
            face_aligner::NAME,
            Box::new(|| Box::new(FaceAligner) as Box<dyn StageTransform>),
            links(Some(&marked), Some(&aligned)),
        ));

        let dir = model_dir.clone();
        let cache = cache_config;
        let reference_url = config.reference_face_url.clone();
        hosts.push(host(
            face_swapper::NAME,
            Box::new(move || {
                let mut catalog = face_swapper::default_catalog();
                catalog.push(face_swapper::reference_entry(reference_url.clone()));
                Box::new(FaceSwapper::new(
                    catalog,
                    &dir,
                    cache.clone(),
                )) as Box<dyn StageTransform>
            }),
            links(Some(&aligned), Some(&faced)),
        ));

        let dir = model_dir;
        hosts.push(host(
            face_animator::NAME,
            Box::new(move || {
                Box::new(FaceAnimator::new(face_animator::default_catalog(), &dir))
                    as Box<dyn StageTransform>
            }),
            links(Some(&aligned), Some(&faced)),
        ));

        hosts.push(host(
            frame_adjuster::NAME,
            Box::new(|| Box::new(FrameAdjuster) as Box<dyn StageTransform>),
            links(Some(&faced), Some(&adjusted)),
        ));

        hosts.push(host(
            face_merger::NAME,
            Box::new(|| Box::new(FaceMerger) as Box<dyn StageTransform>),
            links(Some(&adjusted), Some(&merged)),
        ));

        hosts.push(host(
            stream_output::NAME,
            Box::new(move || Box::new(StreamOutput::new(sink.clone())) as Box<dyn StageTransform>),
            links(Some(&merged), output.as_ref()),
        ));

        Self {
            hosts,
            heap,
            db,
            output,
            mode: config.mode,
            started: false,
        }
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn heap(&self) -> &Arc<WeakHeap> {
        &self.heap
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub fn db(&self) -> &Arc<BackendDb> {
        &self.db
    }

    /// Records leaving the output stage, when `forward_output` is set.
    pub fn output(&self) -> Option<&BackendConnection> {
        self.output.as_ref()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.hosts.iter().map(|h| h.name()).collect()
    }

    pub fn host(&self, name: &str) -> Option<&BackendHost> {
        self.hosts.iter().find(|h| h.name() == name)
    }

    pub fn host_mut(&mut self, name: &str) -> Option<&mut BackendHost> {
        self.hosts.iter_mut().find(|h| h.name() == name)
    }

    /// Starts every stage of the current mode, output end first.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        let mode = self.mode;
        for host in self.hosts.iter_mut().rev() {
            if is_active(host.name(), mode) {
                host.start()?;
            }
        }
        self.started = true;
        log::info!("Pipeline started in {mode} mode");
        Ok(())
    }

    /// Stops every stage, sources first so nothing new enters the pipeline.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        for host in self.hosts.iter_mut() {
            host.stop();
        }
        self.started = false;
        log::info!("Pipeline stopped");
    }

    /// Pumps events of every stage. Call regularly while running.
    pub fn poll(&mut self) {
        for host in self.hosts.iter_mut() {
            host.poll();
        }
    }

    /// Switches between the swapper and the animator. Takes effect
    /// immediately when running.
    pub fn set_mode(&mut self, mode: PipelineMode) -> Result<(), PipelineError> {
        if mode == self.mode {
            return Ok(());
        }
        let previous = self.mode;
        self.mode = mode;
        if self.started {
            self.host_or_err(mode_stage(previous))?.stop();
            self.host_or_err(mode_stage(mode))?.start()?;
        }
        log::info!("Pipeline mode changed from {previous} to {mode}");
        Ok(())
    }

    pub fn set_cell(
        &mut self,
        stage: &str,
        cell: &str,
        value: CellValue,
    ) -> Result<(), PipelineError> {
        self.host_or_err(stage)?.set_cell(cell, value)?;
        Ok(())
    }

    /// Wipes every stage's persisted settings. Running stages restart with
    /// their defaults.
    ///
    /// Running stages are stopped before the wipe so state changes still
    /// queued in their workers are flushed first and then discarded.
    pub fn reset_settings(&mut self) -> Result<(), PipelineError> {
        let running: Vec<usize> = (0..self.hosts.len())
            .filter(|&i| self.hosts[i].is_started())
            .collect();
        for &i in &running {
            self.hosts[i].stop();
        }
        self.db.clear()?;
        log::info!("Cleared all stage settings in {}", self.db.path().display());
        for &i in running.iter().rev() {
            self.hosts[i].start()?;
        }
        Ok(())
    }

    pub fn stage_statuses(&self) -> Vec<StageStatus> {
        self.hosts
            .iter()
            .map(|host| {
                let sheet = host.sheet();
                let error = host.error().map(str::to_string).or_else(|| {
                    sheet.values().find_map(|cell| match &cell.kind {
                        CellKind::Error {
                            message: Some(message),
                        } => Some(message.clone()),
                        _ => None,
                    })
                });
                let cache_stats = sheet.get(CACHE_STATS_CELL).and_then(|cell| match &cell.kind {
                    CellKind::InfoLabel { text } => text.clone(),
                    _ => None,
                });
                let model_progress =
                    sheet
                        .get(MODEL_PROGRESS_CELL)
                        .and_then(|cell| match &cell.kind {
                            CellKind::Progress { percent, caption } => {
                                Some((*percent, caption.clone()))
                            }
                            _ => None,
                        });
                StageStatus {
                    name: host.name().to_string(),
                    state: host.state(),
                    active: is_active(host.name(), self.mode),
                    error,
                    crash_count: host.crash_count(),
                    cache_stats,
                    model_progress,
                }
            })
            .collect()
    }

    fn host_or_err(&mut self, name: &str) -> Result<&mut BackendHost, PipelineError> {
        self.hosts
            .iter_mut()
            .find(|h| h.name() == name)
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }
}

impl Drop for FaceSwapPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn mode_stage(mode: PipelineMode) -> &'static str {
    match mode {
        PipelineMode::FaceSwap => face_swapper::NAME,
        PipelineMode::FaceAnimator => face_animator::NAME,
    }
}

fn is_active(stage: &str, mode: PipelineMode) -> bool {
    PipelineMode::ALL
        .iter()
        .all(|&other| other == mode || mode_stage(other) != stage)
}

fn backend_db_path(config: &PipelineConfig) -> PathBuf {
    config
        .backend_db_path
        .clone()
        .or_else(BackendDb::default_path)
        .unwrap_or_else(|| std::env::temp_dir().join(APP_DIR_NAME).join(BACKEND_DB_FILENAME))
}

fn model_dir(config: &PipelineConfig) -> PathBuf {
    if let Some(dir) = &config.model_dir {
        return dir.clone();
    }
    model_resolver::model_cache_dir().unwrap_or_else(|e| {
        log::warn!("{e}; using the temp directory for models");
        std::env::temp_dir().join(APP_DIR_NAME).join("models")
    })
}
