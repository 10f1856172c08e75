use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::domain::compute_data::ComputeData;
use crate::backend::domain::control_sheet::ControlSheet;
use crate::heap::WeakHeap;

/// What a transform sees while handling one record.
pub struct StageContext<'a> {
    pub stage: &'a str,
    pub heap: &'a WeakHeap,
    pub sheet: &'a mut ControlSheet,
    pub uids: &'a AtomicU64,
}

impl StageContext<'_> {
    /// Pipeline-wide unique record id.
    pub fn allocate_uid(&self) -> u64 {
        self.uids.fetch_add(1, Ordering::Relaxed)
    }
}

/// Domain interface for one pipeline stage, run by a backend worker.
///
/// The worker owns the tick loop; a transform only registers its cells, reacts
/// to cell changes and handles records. Implementations may be stateful,
/// hence `&mut self`.
pub trait StageTransform: Send {
    /// Registers this stage's cells. Called once per worker start, before
    /// persisted state is applied.
    fn setup_sheet(&mut self, sheet: &mut ControlSheet);

    /// Called after a user-settable cell changed, either from the host or from
    /// persisted state being re-applied.
    fn on_cell_changed(&mut self, _name: &str, _sheet: &mut ControlSheet) {}

    /// Drains asynchronous lifecycle events such as model loading.
    ///
    /// Returns `true` when the stage's output would now differ for the same
    /// input (e.g. a model finished loading), so the last frame should be re-emitted.
    fn poll_events(&mut self, _sheet: &mut ControlSheet) -> bool {
        false
    }

    /// Produces a new record. Only called on stages without an input connection.
    fn produce(
        &mut self,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Option<ComputeData>, Box<dyn std::error::Error>> {
        Ok(None)
    }

    /// Transforms a record in place. An error drops the record.
    fn process(
        &mut self,
        record: &mut ComputeData,
        ctx: &mut StageContext<'_>,
    ) -> Result<(), Box<dyn std::error::Error>>;

    /// Releases resources when the worker exits.
    fn shutdown(&mut self) {}
}
