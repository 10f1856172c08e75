use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::domain::compute_data::ComputeData;
use crate::backend::domain::control_sheet::{ControlSheet, NumberConfig};
use crate::backend::domain::stage_transform::{StageContext, StageTransform};
use crate::shared::constants::DEFAULT_SOURCE_FPS;
use crate::stages::domain::frame_source::FrameSource;

pub const NAME: &str = "file_source";

const FPS_CELL: &str = "fps";
const PAUSED_CELL: &str = "paused";
const LOOP_CELL: &str = "loop";
const FRAMES_CELL: &str = "frames_emitted";
const SOURCE_ERROR_CELL: &str = "source_error";

/// Opens the frame source each time the stage starts.
pub type SourceOpener =
    Arc<dyn Fn() -> Result<Box<dyn FrameSource>, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Source stage: paces frames from a [`FrameSource`] into the heap.
pub struct FileSource {
    opener: SourceOpener,
    source: Option<Box<dyn FrameSource>>,
    default_fps: f64,
    next_due: Option<Instant>,
    emitted: usize,
    exhausted: bool,
}

impl FileSource {
    pub fn new(opener: SourceOpener, default_fps: f64) -> Self {
        Self {
            opener,
            source: None,
            default_fps,
            next_due: None,
            emitted: 0,
            exhausted: false,
        }
    }

    fn frame_interval(sheet: &ControlSheet) -> Duration {
        let fps = sheet.number(FPS_CELL).unwrap_or(DEFAULT_SOURCE_FPS).max(1.0);
        Duration::from_secs_f64(1.0 / fps)
    }
}

impl StageTransform for FileSource {
    fn setup_sheet(&mut self, sheet: &mut ControlSheet) {
        let results = [
            sheet.add_number(FPS_CELL, NumberConfig::new(1.0, 240.0, 1.0, 0), self.default_fps),
            sheet.add_flag(PAUSED_CELL, false),
            sheet.add_flag(LOOP_CELL, false),
            sheet.add_info_label(FRAMES_CELL),
            sheet.add_error(SOURCE_ERROR_CELL),
        ];
        for result in results {
            if let Err(e) = result {
                log::warn!("{NAME}: {e}");
            }
        }
        match (self.opener)() {
            Ok(source) => self.source = Some(source),
            Err(e) => {
                log::error!("{NAME}: cannot open source: {e}");
                let _ = sheet.set_error(SOURCE_ERROR_CELL, Some(e.to_string()));
            }
        }
    }

    fn on_cell_changed(&mut self, cell: &str, sheet: &mut ControlSheet) {
        if cell == LOOP_CELL && sheet.flag(LOOP_CELL) == Some(true) && self.exhausted {
            self.exhausted = false;
            if let Some(source) = self.source.as_mut() {
                source.rewind();
            }
        }
    }

    fn produce(
        &mut self,
        ctx: &mut StageContext<'_>,
    ) -> Result<Option<ComputeData>, Box<dyn std::error::Error>> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        if self.exhausted || ctx.sheet.flag(PAUSED_CELL) == Some(true) {
            return Ok(None);
        }
        let now = Instant::now();
        if self.next_due.is_some_and(|due| now < due) {
            return Ok(None);
        }
        self.next_due = Some(now + Self::frame_interval(ctx.sheet));

        let frame = match source.next_frame()? {
            Some(frame) => frame,
            None if ctx.sheet.flag(LOOP_CELL) == Some(true) => {
                source.rewind();
                match source.next_frame()? {
                    Some(frame) => frame,
                    None => return Ok(None),
                }
            }
            None => {
                log::info!("{NAME}: end of input after {} frame(s)", self.emitted);
                self.exhausted = true;
                return Ok(None);
            }
        };

        let mut record = ComputeData::new(ctx.allocate_uid(), self.emitted);
        let key = record.heap_key(ctx.stage, "frame");
        record.frame_image = Some(ctx.heap.write_frame(&key, frame)?);
        self.emitted += 1;
        let _ = ctx.sheet.set_info(FRAMES_CELL, Some(self.emitted.to_string()));
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
