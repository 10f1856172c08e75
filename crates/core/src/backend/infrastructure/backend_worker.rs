use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::backend::domain::compute_data::ComputeData;
use crate::backend::domain::control_sheet::{CellValue, ControlSheet, SheetSnapshot};
use crate::backend::domain::stage_state::StageState;
use crate::backend::domain::stage_transform::{StageContext, StageTransform};
use crate::backend::domain::worker_state::WorkerState;
use crate::backend::infrastructure::backend_connection::{BackendConnection, PendingRecord};
use crate::backend::infrastructure::backend_signal::{BackendSignal, SignalReceiver};
use crate::heap::{HeapError, WeakHeap};
use crate::pipeline::pipeline_logger::{NullPipelineLogger, PipelineLogger, StdoutPipelineLogger};
use crate::shared::constants::{DEFAULT_BACKOFF_MS, DEFAULT_READ_TIMEOUT_MS};

/// Error cell every worker registers for per-record failures.
pub const LAST_ERROR_CELL: &str = "last_error";

const SUMMARY_THROTTLE_FRAMES: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorkerConfig {
    /// Input read timeout; sets pipeline cadence.
    pub read_timeout: Duration,
    /// Sleep between delivery attempts under backpressure, and between idle source ticks.
    pub backoff: Duration,
    pub timing_logs: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            timing_logs: false,
        }
    }
}

pub enum WorkerCommand {
    SetCell { name: String, value: CellValue },
    Stop,
}

pub enum WorkerEvent {
    State(StageState),
    Sheet(SheetSnapshot),
    StateChanged(WorkerState),
}

/// Everything a worker shares with the rest of the pipeline.
#[derive(Clone)]
pub struct WorkerLinks {
    pub heap: Arc<WeakHeap>,
    pub input: Option<BackendConnection>,
    pub output: Option<BackendConnection>,
    pub signal: BackendSignal,
    pub uids: Arc<AtomicU64>,
}

/// Runs one stage's tick loop on its own thread.
///
/// Each tick: drain host commands, drain async lifecycle events, read a record
/// (bounded wait) if none is held, transform it, then try to hand the held
/// record downstream. A failing or panicking record is dropped and reported
/// on the `last_error` cell; the loop keeps going. A record whose input frame
/// was evicted from the heap is skipped without an error.
pub struct BackendWorker {
    name: String,
    transform: Box<dyn StageTransform>,
    sheet: ControlSheet,
    state: WorkerState,
    links: WorkerLinks,
    reemit: Option<SignalReceiver>,
    commands: Receiver<WorkerCommand>,
    events: Sender<WorkerEvent>,
    stop: Arc<AtomicBool>,
    pending: PendingRecord,
    last_emitted: Option<ComputeData>,
    activity: StageState,
    sent_revision: Option<u64>,
    logger: Box<dyn PipelineLogger>,
    config: WorkerConfig,
}

impl BackendWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        transform: Box<dyn StageTransform>,
        state: WorkerState,
        links: WorkerLinks,
        commands: Receiver<WorkerCommand>,
        events: Sender<WorkerEvent>,
        stop: Arc<AtomicBool>,
        config: WorkerConfig,
    ) -> Self {
        // Only sources re-emit; downstream stages see the re-emitted record.
        let reemit = links
            .input
            .is_none()
            .then(|| links.signal.subscribe());
        let logger: Box<dyn PipelineLogger> = if config.timing_logs {
            Box::new(StdoutPipelineLogger::new(name, SUMMARY_THROTTLE_FRAMES))
        } else {
            Box::new(NullPipelineLogger)
        };
        Self {
            name: name.to_string(),
            transform,
            sheet: ControlSheet::new(),
            state,
            links,
            reemit,
            commands,
            events,
            stop,
            pending: PendingRecord::new(),
            last_emitted: None,
            activity: StageState::Starting,
            sent_revision: None,
            logger,
            config,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("stage-{}", self.name))
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        self.startup();
        while self.tick() {}
        self.finish();
    }

    fn startup(&mut self) {
        if let Err(e) = self.sheet.add_error(LAST_ERROR_CELL) {
            log::warn!("{}: {e}", self.name);
        }
        self.transform.setup_sheet(&mut self.sheet);
        for name in self.state.apply_to(&mut self.sheet) {
            self.transform.on_cell_changed(&name, &mut self.sheet);
        }
        log::info!("Stage {} started", self.name);
        self.set_activity(StageState::Idle);
        self.publish_sheet();
    }

    fn finish(&mut self) {
        self.transform.shutdown();
        self.logger.summary();
        self.publish_sheet();
        self.set_activity(StageState::Stopped);
        log::info!("Stage {} stopped", self.name);
    }

    /// One pass of the loop. Returns `false` when the worker should exit.
    fn tick(&mut self) -> bool {
        if self.stop.load(Ordering::Relaxed) || !self.drain_commands() {
            return false;
        }
        if self.transform.poll_events(&mut self.sheet) {
            self.links.signal.send();
        }

        let mut worked = false;
        if !self.pending.is_holding() {
            if let Some(record) = self.next_record() {
                worked = true;
                self.set_activity(StageState::Busy);
                self.process(record);
            }
        }

        if self.pending.is_holding() {
            if !self.deliver() {
                thread::sleep(self.config.backoff);
            }
        } else if !worked {
            self.set_activity(StageState::Idle);
            if self.links.input.is_none() {
                thread::sleep(self.config.backoff);
            }
        }

        self.publish_sheet();
        true
    }

    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(WorkerCommand::Stop) | Err(TryRecvError::Disconnected) => return false,
                Ok(WorkerCommand::SetCell { name, value }) => self.apply_cell(&name, &value),
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn apply_cell(&mut self, name: &str, value: &CellValue) {
        match self.sheet.apply(name, value) {
            Ok(true) => {
                if let Some(normalized) = self.sheet.value(name) {
                    self.state.set(name, &normalized);
                }
                let _ = self.events.send(WorkerEvent::StateChanged(self.state.clone()));
                self.transform.on_cell_changed(name, &mut self.sheet);
                // Recompute the current frame now rather than waiting for a new one.
                self.links.signal.send();
            }
            Ok(false) => {}
            Err(e) => log::warn!("{}: rejected {name} = {value}: {e}", self.name),
        }
    }

    fn next_record(&mut self) -> Option<ComputeData> {
        if let Some(input) = &self.links.input {
            return input.read(self.config.read_timeout);
        }

        let reemit = self.reemit.as_ref().is_some_and(|rx| rx.recv());
        if reemit {
            if let Some(last) = &self.last_emitted {
                let uid = self.links.uids.fetch_add(1, Ordering::Relaxed);
                log::debug!("{}: re-emitting frame #{}", self.name, last.frame_index());
                return Some(last.reissue(uid));
            }
        }

        let mut ctx = StageContext {
            stage: &self.name,
            heap: &self.links.heap,
            sheet: &mut self.sheet,
            uids: &self.links.uids,
        };
        match self.transform.produce(&mut ctx) {
            Ok(record) => record,
            Err(e) => {
                self.report_failure(&*e);
                None
            }
        }
    }

    fn process(&mut self, mut record: ComputeData) {
        let started = Instant::now();
        let result = {
            let mut ctx = StageContext {
                stage: &self.name,
                heap: &self.links.heap,
                sheet: &mut self.sheet,
                uids: &self.links.uids,
            };
            let transform = &mut self.transform;
            panic::catch_unwind(AssertUnwindSafe(|| transform.process(&mut record, &mut ctx)))
        };

        match result {
            Ok(Ok(())) => {
                self.logger
                    .timing("transform", started.elapsed().as_secs_f64() * 1000.0);
                self.logger.frame_processed(record.frame_index());
                if self.sheet.error(LAST_ERROR_CELL).is_some() {
                    let _ = self.sheet.set_error(LAST_ERROR_CELL, None);
                }
                if self.links.input.is_none() {
                    self.last_emitted = Some(record.clone());
                }
                if self.links.output.is_some() {
                    self.pending.hold(record);
                }
            }
            Ok(Err(e)) => match e.downcast_ref::<HeapError>() {
                Some(HeapError::Missing(key)) => {
                    log::debug!(
                        "{}: skipping frame #{}, {key} was evicted",
                        self.name,
                        record.frame_index()
                    );
                    self.logger.metric("heap_misses", 1.0);
                }
                _ => self.report_failure(&*e),
            },
            Err(payload) => {
                let error: Box<dyn std::error::Error> =
                    format!("transform panicked: {}", panic_message(payload.as_ref())).into();
                self.report_failure(&*error);
            }
        }
    }

    fn report_failure(&mut self, error: &dyn std::error::Error) {
        log::warn!("{}: dropping record: {error}", self.name);
        self.logger.metric("dropped_records", 1.0);
        let _ = self.sheet.set_error(LAST_ERROR_CELL, Some(error.to_string()));
    }

    /// Returns `true` once nothing is held.
    fn deliver(&mut self) -> bool {
        let Some(output) = &self.links.output else {
            self.pending.take();
            return true;
        };
        let retries = self.pending.retries();
        if self.pending.try_deliver(output) {
            if retries > 0 {
                self.logger.metric("backpressure_retries", retries as f64);
            }
            true
        } else {
            false
        }
    }

    fn set_activity(&mut self, state: StageState) {
        if self.activity != state {
            self.activity = state;
            let _ = self.events.send(WorkerEvent::State(state));
        }
    }

    fn publish_sheet(&mut self) {
        let revision = self.sheet.revision();
        if self.sent_revision != Some(revision) {
            self.sent_revision = Some(revision);
            let _ = self.events.send(WorkerEvent::Sheet(self.sheet.snapshot()));
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::domain::control_sheet::NumberConfig;
    use crate::heap::ImageRef;
    use crate::shared::frame::Frame;

    const WAIT: Duration = Duration::from_secs(2);

    /// Fails every record whose frame index is in `fail_on`; otherwise tags the
    /// record by pushing a merged image reference named after the gain cell.
    struct StubTransform {
        fail_on: Vec<usize>,
    }

    impl StageTransform for StubTransform {
        fn setup_sheet(&mut self, sheet: &mut ControlSheet) {
            sheet
                .add_number("gain", NumberConfig::new(0.0, 10.0, 1.0, 0), 1.0)
                .unwrap();
        }

        fn process(
            &mut self,
            record: &mut ComputeData,
            ctx: &mut StageContext<'_>,
        ) -> Result<(), Box<dyn std::error::Error>> {
            if self.fail_on.contains(&record.frame_index()) {
                return Err(format!("bad frame {}", record.frame_index()).into());
            }
            let gain = ctx.sheet.number("gain").unwrap_or_default();
            record.merged_image = Some(ImageRef {
                key: format!("gain={gain}"),
                width: 1,
                height: 1,
                channels: 1,
            });
            Ok(())
        }
    }

    /// Emits frames 0..count once, writing each to the heap.
    struct StubSource {
        next: usize,
        count: usize,
    }

    impl StageTransform for StubSource {
        fn setup_sheet(&mut self, _sheet: &mut ControlSheet) {}

        fn produce(
            &mut self,
            ctx: &mut StageContext<'_>,
        ) -> Result<Option<ComputeData>, Box<dyn std::error::Error>> {
            if self.next >= self.count {
                return Ok(None);
            }
            let mut record = ComputeData::new(ctx.allocate_uid(), self.next);
            let key = record.heap_key(ctx.stage, "frame");
            record.frame_image = Some(ctx.heap.write_frame(&key, Frame::filled(2, 2, 3, 0))?);
            self.next += 1;
            Ok(Some(record))
        }

        fn process(
            &mut self,
            _record: &mut ComputeData,
            _ctx: &mut StageContext<'_>,
        ) -> Result<(), Box<dyn std::error::Error>> {
            Ok(())
        }
    }

    /// Reads the record's frame back from the heap; panics on `panic_on`.
    struct FrameReader {
        panic_on: Option<usize>,
    }

    impl StageTransform for FrameReader {
        fn setup_sheet(&mut self, _sheet: &mut ControlSheet) {}

        fn process(
            &mut self,
            record: &mut ComputeData,
            ctx: &mut StageContext<'_>,
        ) -> Result<(), Box<dyn std::error::Error>> {
            if self.panic_on == Some(record.frame_index()) {
                panic!("cursed frame {}", record.frame_index());
            }
            let image = record.frame_image.as_ref().ok_or("record has no frame")?;
            ctx.heap.require_frame(image)?;
            Ok(())
        }
    }

    struct Harness {
        heap: Arc<WeakHeap>,
        input: BackendConnection,
        output: BackendConnection,
        signal: BackendSignal,
        commands: Sender<WorkerCommand>,
        events: Receiver<WorkerEvent>,
        stop: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    impl Harness {
        fn start(transform: Box<dyn StageTransform>, source: bool) -> Self {
            let input = BackendConnection::new(1);
            let output = BackendConnection::new(1);
            let signal = BackendSignal::new();
            let heap = Arc::new(WeakHeap::new(1 << 20));
            let links = WorkerLinks {
                heap: heap.clone(),
                input: (!source).then(|| input.clone()),
                output: Some(output.clone()),
                signal: signal.clone(),
                uids: Arc::new(AtomicU64::new(0)),
            };
            let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
            let (ev_tx, ev_rx) = crossbeam_channel::unbounded();
            let stop = Arc::new(AtomicBool::new(false));
            let worker = BackendWorker::new(
                "stub",
                transform,
                WorkerState::new(),
                links,
                cmd_rx,
                ev_tx,
                stop.clone(),
                WorkerConfig::default(),
            );
            let handle = worker.spawn().unwrap();
            Self {
                heap,
                input,
                output,
                signal,
                commands: cmd_tx,
                events: ev_rx,
                stop,
                handle: Some(handle),
            }
        }

        fn feed(&self, frame_index: usize) {
            self.feed_record(ComputeData::new(frame_index as u64, frame_index));
        }

        /// Stores a 2x2 frame on the heap and feeds a record pointing at it.
        fn feed_with_frame(&self, frame_index: usize) {
            let mut record = ComputeData::new(frame_index as u64, frame_index);
            let key = record.heap_key("upstream", "frame");
            record.frame_image = Some(self.heap.write_frame(&key, Frame::filled(2, 2, 3, 0)).unwrap());
            self.feed_record(record);
        }

        fn feed_record(&self, record: ComputeData) {
            let mut pending = PendingRecord::new();
            pending.hold(record);
            let deadline = Instant::now() + WAIT;
            while !pending.try_deliver(&self.input) {
                assert!(Instant::now() < deadline, "worker never consumed input");
                thread::sleep(Duration::from_millis(1));
            }
        }

        fn receive(&self) -> ComputeData {
            self.output.read(WAIT).expect("no record delivered")
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(h) = self.handle.take() {
                let _ = h.join();
            }
        }
    }

    fn last_error(events: &Receiver<WorkerEvent>) -> Option<String> {
        let mut error = None;
        for event in events.try_iter() {
            if let WorkerEvent::Sheet(sheet) = event {
                if let Some(cell) = sheet.get(LAST_ERROR_CELL) {
                    if let crate::backend::domain::control_sheet::CellKind::Error { message } =
                        &cell.kind
                    {
                        error = message.clone();
                    }
                }
            }
        }
        error
    }

    fn wait_for_error(events: &Receiver<WorkerEvent>) -> Option<String> {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Some(error) = last_error(events) {
                return Some(error);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    /// Every error message any published sheet carried.
    fn errors_seen(events: &Receiver<WorkerEvent>) -> Vec<String> {
        events
            .try_iter()
            .filter_map(|event| match event {
                WorkerEvent::Sheet(sheet) => sheet.get(LAST_ERROR_CELL).and_then(|cell| {
                    match &cell.kind {
                        crate::backend::domain::control_sheet::CellKind::Error { message } => {
                            message.clone()
                        }
                        _ => None,
                    }
                }),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_record_after_failing_record_is_processed() {
        let h = Harness::start(Box::new(StubTransform { fail_on: vec![1] }), false);

        h.feed(0);
        assert_eq!(h.receive().frame_index(), 0);
        h.feed(1);
        h.feed(2);

        let next = h.receive();
        assert_eq!(next.frame_index(), 2);
        assert!(h.output.read(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_failure_is_reported_on_error_cell() {
        let h = Harness::start(Box::new(StubTransform { fail_on: vec![0] }), false);
        h.feed(0);

        let deadline = Instant::now() + WAIT;
        let mut seen = None;
        while seen.is_none() && Instant::now() < deadline {
            seen = last_error(&h.events);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.as_deref(), Some("bad frame 0"));
    }

    #[test]
    fn test_panicking_record_is_reported_and_worker_keeps_running() {
        let h = Harness::start(Box::new(FrameReader { panic_on: Some(0) }), false);

        h.feed_with_frame(0);
        let error = wait_for_error(&h.events).expect("panic was not reported");
        assert!(error.contains("panicked"), "{error}");
        assert!(error.contains("cursed frame 0"), "{error}");

        h.feed_with_frame(1);
        assert_eq!(h.receive().frame_index(), 1);
        assert!(h.handle.as_ref().is_some_and(|handle| !handle.is_finished()));
    }

    #[test]
    fn test_evicted_frame_is_skipped_without_error() {
        let h = Harness::start(Box::new(FrameReader { panic_on: None }), false);

        let mut evicted = ComputeData::new(0, 0);
        let key = evicted.heap_key("upstream", "frame");
        evicted.frame_image = Some(h.heap.write_frame(&key, Frame::filled(2, 2, 3, 0)).unwrap());
        assert!(h.heap.remove(&key));
        h.feed_record(evicted);
        thread::sleep(Duration::from_millis(50));

        h.feed_with_frame(1);
        assert_eq!(h.receive().frame_index(), 1);
        assert!(h.output.read(Duration::from_millis(50)).is_none());
        assert!(errors_seen(&h.events).is_empty());
    }

    #[test]
    fn test_held_record_delivered_once_consumer_frees_slot() {
        let h = Harness::start(Box::new(StubTransform { fail_on: vec![] }), false);
        h.feed(0);
        h.feed(1);
        // Output holds record 0; record 1 is held by the worker under backpressure.
        thread::sleep(Duration::from_millis(50));
        assert!(h.output.is_full_read(1));

        assert_eq!(h.receive().frame_index(), 0);
        assert_eq!(h.receive().frame_index(), 1);
        assert!(h.output.read(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_set_cell_persists_state_and_triggers_signal() {
        let h = Harness::start(Box::new(StubTransform { fail_on: vec![] }), false);
        let observer = h.signal.subscribe();

        h.commands
            .send(WorkerCommand::SetCell {
                name: "gain".into(),
                value: CellValue::Number(3.0),
            })
            .unwrap();

        assert!(observer.wait(WAIT));
        h.feed(0);
        assert_eq!(h.receive().merged_image.unwrap().key, "gain=3");
        let changed = h.events.try_iter().find_map(|e| match e {
            WorkerEvent::StateChanged(state) => Some(state),
            _ => None,
        });
        assert_eq!(
            changed.unwrap().get("gain"),
            Some(&serde_json::json!(3.0))
        );
    }

    #[test]
    fn test_source_reemits_last_record_on_signal() {
        let h = Harness::start(Box::new(StubSource { next: 0, count: 1 }), true);
        let first = h.receive();
        assert!(h.output.read(Duration::from_millis(30)).is_none());

        h.signal.send();

        let again = h.receive();
        assert_eq!(again.frame_index(), first.frame_index());
        assert_ne!(again.uid(), first.uid());
        assert_eq!(again.frame_image, first.frame_image);
    }

    #[test]
    fn test_source_without_frame_ignores_signal() {
        let h = Harness::start(Box::new(StubSource { next: 0, count: 0 }), true);
        h.signal.send();
        assert!(h.output.read(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn test_stop_command_ends_worker() {
        let mut h = Harness::start(Box::new(StubTransform { fail_on: vec![] }), false);
        h.commands.send(WorkerCommand::Stop).unwrap();
        let handle = h.handle.take().unwrap();
        let deadline = Instant::now() + WAIT;
        while !handle.is_finished() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        handle.join().unwrap();
        let states: Vec<StageState> = h
            .events
            .try_iter()
            .filter_map(|e| match e {
                WorkerEvent::State(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(states.last(), Some(&StageState::Stopped));
    }
}
