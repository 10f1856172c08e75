use std::sync::Arc;

use crate::backend::domain::compute_data::ComputeData;
use crate::backend::domain::control_sheet::ControlSheet;
use crate::backend::domain::stage_transform::{StageContext, StageTransform};
use crate::stages::domain::frame_sink::FrameSink;

pub const NAME: &str = "stream_output";

const SAVE_CELL: &str = "save_frames";
const WRITTEN_CELL: &str = "frames_written";
const SINK_ERROR_CELL: &str = "sink_error";

/// Opens the sink each time the stage starts.
pub type SinkOpener =
    Arc<dyn Fn() -> Result<Box<dyn FrameSink>, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Final stage: hands the merged frame to a [`FrameSink`]. The record itself
/// is forwarded downstream when the pipeline exposes an output connection.
pub struct StreamOutput {
    opener: Option<SinkOpener>,
    sink: Option<Box<dyn FrameSink>>,
    written: usize,
}

impl StreamOutput {
    pub fn new(opener: Option<SinkOpener>) -> Self {
        Self {
            opener,
            sink: None,
            written: 0,
        }
    }
}

impl StageTransform for StreamOutput {
    fn setup_sheet(&mut self, sheet: &mut ControlSheet) {
        let results = [
            sheet.add_flag(SAVE_CELL, true),
            sheet.add_info_label(WRITTEN_CELL),
            sheet.add_error(SINK_ERROR_CELL),
        ];
        for result in results {
            if let Err(e) = result {
                log::warn!("{NAME}: {e}");
            }
        }
        let Some(opener) = &self.opener else {
            let _ = sheet.set_enabled(SAVE_CELL, false);
            return;
        };
        match opener() {
            Ok(sink) => self.sink = Some(sink),
            Err(e) => {
                log::error!("{NAME}: cannot open sink: {e}");
                let _ = sheet.set_error(SINK_ERROR_CELL, Some(e.to_string()));
            }
        }
    }

    fn process(
        &mut self,
        record: &mut ComputeData,
        ctx: &mut StageContext<'_>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        if ctx.sheet.flag(SAVE_CELL) != Some(true) {
            return Ok(());
        }
        let image = record.output_image().ok_or("record has no image")?;
        let frame = ctx.heap.require_frame(image)?.with_index(record.frame_index());
        sink.write(&frame)?;
        self.written += 1;
        let _ = ctx.sheet.set_info(WRITTEN_CELL, Some(self.written.to_string()));
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.finish() {
                log::error!("{NAME}: failed to finish sink: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::domain::control_sheet::CellValue;
    use crate::shared::frame::Frame;
    use crate::stages::test_support::StageEnv;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<(usize, u8)>>>,
    }

    impl FrameSink for RecordingSink {
        fn write(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
            self.frames.lock().unwrap().push((frame.index(), frame.data()[0]));
            Ok(())
        }
    }

    fn opener(sink: RecordingSink) -> SinkOpener {
        Arc::new(
            move || -> Result<Box<dyn FrameSink>, Box<dyn std::error::Error + Send + Sync>> {
                Ok(Box::new(sink.clone()))
            },
        )
    }

    #[test]
    fn test_writes_merged_image_with_record_index() {
        let sink = RecordingSink::default();
        let mut env = StageEnv::new();
        let mut stage = StreamOutput::new(Some(opener(sink.clone())));
        env.setup(&mut stage);
        let mut record = ComputeData::new(1, 42);
        record.frame_image = Some(env.heap.write_frame("src", Frame::filled(2, 2, 3, 1)).unwrap());
        record.merged_image = Some(env.heap.write_frame("merged", Frame::filled(2, 2, 3, 9)).unwrap());

        env.process(NAME, &mut stage, &mut record).unwrap();

        assert_eq!(*sink.frames.lock().unwrap(), vec![(42, 9)]);
        assert_eq!(env.sheet.info(WRITTEN_CELL), Some("1"));
    }

    #[test]
    fn test_save_flag_off_skips_sink() {
        let sink = RecordingSink::default();
        let mut env = StageEnv::new();
        let mut stage = StreamOutput::new(Some(opener(sink.clone())));
        env.setup(&mut stage);
        env.set(&mut stage, SAVE_CELL, CellValue::Flag(false));
        let mut record = env.record(Frame::filled(2, 2, 3, 1));

        env.process(NAME, &mut stage, &mut record).unwrap();

        assert!(sink.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_without_sink_records_pass() {
        let mut env = StageEnv::new();
        let mut stage = StreamOutput::new(None);
        env.setup(&mut stage);
        let mut record = env.record(Frame::filled(2, 2, 3, 1));

        assert!(env.process(NAME, &mut stage, &mut record).is_ok());
        assert!(!env.sheet.cell(SAVE_CELL).unwrap().enabled);
    }

    #[test]
    fn test_sink_open_failure_is_reported() {
        let failing: SinkOpener = Arc::new(
            || -> Result<Box<dyn FrameSink>, Box<dyn std::error::Error + Send + Sync>> {
                Err("disk full".into())
            },
        );
        let mut env = StageEnv::new();
        let mut stage = StreamOutput::new(Some(failing));
        env.setup(&mut stage);
        assert_eq!(env.sheet.error(SINK_ERROR_CELL), Some("disk full"));
    }
}
