use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

use crate::backend::domain::control_sheet::{Cell, CellKind, CellValue, SheetSnapshot};
use crate::backend::domain::stage_state::StageState;
use crate::backend::domain::stage_transform::StageTransform;
use crate::backend::infrastructure::backend_db::{BackendDb, BackendDbError};
use crate::backend::infrastructure::backend_worker::{
    panic_message, BackendWorker, WorkerCommand, WorkerConfig, WorkerEvent, WorkerLinks,
    LAST_ERROR_CELL,
};
use crate::shared::constants::DEFAULT_JOIN_TIMEOUT_MS;

/// Builds a fresh transform for each worker start.
pub type TransformFactory = Box<dyn Fn() -> Box<dyn StageTransform> + Send>;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to spawn worker for stage {stage}: {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stage {0} is not running")]
    NotRunning(String),
    #[error(transparent)]
    Db(#[from] BackendDbError),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HostConfig {
    pub worker: WorkerConfig,
    /// How long `stop` waits for the worker before abandoning it.
    pub join_timeout: Duration,
    /// Start a fresh worker after a crash.
    pub auto_restart: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT_MS),
            auto_restart: false,
        }
    }
}

struct RunningWorker {
    handle: JoinHandle<()>,
    commands: Sender<WorkerCommand>,
    events: Receiver<WorkerEvent>,
    stop: Arc<AtomicBool>,
}

/// Owns one stage's worker thread from the controlling side.
///
/// The host keeps a mirror of the worker's control sheet, persists every state
/// change to the [`BackendDb`], and notices when the worker dies without being
/// asked to. Call [`poll`](Self::poll) regularly to pump worker events.
pub struct BackendHost {
    name: String,
    factory: TransformFactory,
    links: WorkerLinks,
    db: Arc<BackendDb>,
    config: HostConfig,
    state: StageState,
    worker: Option<RunningWorker>,
    sheet: SheetSnapshot,
    crash_count: u32,
    last_crash: Option<String>,
}

impl BackendHost {
    pub fn new(
        name: &str,
        factory: TransformFactory,
        links: WorkerLinks,
        db: Arc<BackendDb>,
        config: HostConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            factory,
            links,
            db,
            config,
            state: StageState::Initial,
            worker: None,
            sheet: SheetSnapshot::new(),
            crash_count: 0,
            last_crash: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.worker.is_some()
    }

    /// Last sheet the worker published.
    pub fn sheet(&self) -> &SheetSnapshot {
        &self.sheet
    }

    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.sheet.get(name)
    }

    pub fn error(&self) -> Option<&str> {
        match self.sheet.get(LAST_ERROR_CELL).map(|c| &c.kind) {
            Some(CellKind::Error { message }) => message.as_deref(),
            _ => None,
        }
    }

    pub fn crash_count(&self) -> u32 {
        self.crash_count
    }

    pub fn last_crash(&self) -> Option<&str> {
        self.last_crash.as_deref()
    }

    /// Spawns the worker with the persisted state. No-op when already running.
    pub fn start(&mut self) -> Result<(), HostError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let persisted = self.db.load(&self.name).unwrap_or_default();
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (ev_tx, ev_rx) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = BackendWorker::new(
            &self.name,
            (self.factory)(),
            persisted,
            self.links.clone(),
            cmd_rx,
            ev_tx,
            stop.clone(),
            self.config.worker,
        );
        let handle = worker.spawn().map_err(|source| HostError::Spawn {
            stage: self.name.clone(),
            source,
        })?;

        self.worker = Some(RunningWorker {
            handle,
            commands: cmd_tx,
            events: ev_rx,
            stop,
        });
        self.state = StageState::Starting;
        log::debug!("Stage {} starting", self.name);
        Ok(())
    }

    /// Asks the worker to stop and waits up to the join timeout.
    ///
    /// A worker that does not finish in time is abandoned: its stop flag stays
    /// set and the thread is detached.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.state = StageState::Stopping;
        worker.stop.store(true, Ordering::Relaxed);
        let _ = worker.commands.send(WorkerCommand::Stop);

        let deadline = Instant::now() + self.config.join_timeout;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        if worker.handle.is_finished() {
            if let Err(payload) = worker.handle.join() {
                log::error!(
                    "Stage {} panicked while stopping: {}",
                    self.name,
                    panic_message(payload.as_ref())
                );
            }
        } else {
            log::error!(
                "Stage {} did not stop within {:?}; forcing termination",
                self.name,
                self.config.join_timeout
            );
        }

        self.drain(&worker.events);
        self.state = StageState::Stopped;
    }

    pub fn restart(&mut self) -> Result<(), HostError> {
        self.stop();
        self.start()
    }

    /// Pumps worker events and checks for an unexpected exit.
    pub fn poll(&mut self) {
        let Some(worker) = self.worker.as_ref() else {
            return;
        };
        let events: Vec<WorkerEvent> = worker.events.try_iter().collect();
        let finished = worker.handle.is_finished();
        for event in events {
            self.handle_event(event);
        }
        if finished {
            self.handle_crash();
        }
    }

    /// Polls until `done` holds or `timeout` passes.
    pub fn wait_until(&mut self, timeout: Duration, done: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            if done(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Sends a cell change to the running worker, or writes it straight into
    /// the persisted state when the stage is stopped.
    pub fn set_cell(&mut self, name: &str, value: CellValue) -> Result<(), HostError> {
        match &self.worker {
            Some(worker) => worker
                .commands
                .send(WorkerCommand::SetCell {
                    name: name.to_string(),
                    value,
                })
                .map_err(|_| HostError::NotRunning(self.name.clone())),
            None => {
                let mut state = self.db.load(&self.name).unwrap_or_default();
                state.set(name, &value);
                self.db.save(&self.name, &state)?;
                Ok(())
            }
        }
    }

    /// Drops this stage's persisted state and restarts a running worker on
    /// the defaults.
    ///
    /// The worker is stopped first so its queued state changes are saved
    /// before the entry is removed, not after.
    pub fn reset_state(&mut self) -> Result<(), HostError> {
        let running = self.worker.is_some();
        self.stop();
        self.db.remove(&self.name)?;
        if running {
            self.start()?;
        }
        Ok(())
    }

    fn drain(&mut self, events: &Receiver<WorkerEvent>) {
        let pending: Vec<WorkerEvent> = events.try_iter().collect();
        for event in pending {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::State(state) => {
                if self.worker.is_some() {
                    self.state = state;
                }
            }
            WorkerEvent::Sheet(sheet) => self.sheet = sheet,
            WorkerEvent::StateChanged(state) => {
                if let Err(e) = self.db.save(&self.name, &state) {
                    log::error!("Failed to persist state of stage {}: {e}", self.name);
                }
            }
        }
    }

    fn handle_crash(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.drain(&worker.events);
        let reason = match worker.handle.join() {
            Err(payload) => panic_message(payload.as_ref()),
            Ok(()) => "worker exited unexpectedly".to_string(),
        };
        log::error!("Stage {} crashed: {reason}", self.name);

        self.crash_count += 1;
        let message = format!("worker crashed: {reason}");
        if let Some(cell) = self.sheet.get_mut(LAST_ERROR_CELL) {
            cell.kind = CellKind::Error {
                message: Some(message.clone()),
            };
        }
        self.last_crash = Some(message);
        self.state = StageState::Stopped;

        if self.config.auto_restart {
            log::warn!("Restarting stage {}", self.name);
            if let Err(e) = self.start() {
                log::error!("Failed to restart stage {}: {e}", self.name);
            }
        }
    }
}

impl Drop for BackendHost {
    fn drop(&mut self) {
        self.stop();
    }
}
