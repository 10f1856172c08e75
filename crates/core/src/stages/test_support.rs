use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use crate::backend::domain::compute_data::ComputeData;
use crate::backend::domain::control_sheet::{CellValue, ControlSheet};
use crate::backend::domain::stage_transform::{StageContext, StageTransform};
use crate::heap::WeakHeap;
use crate::shared::frame::Frame;

/// Heap, sheet and uid counter for driving a single transform in tests.
pub(crate) struct StageEnv {
    pub heap: WeakHeap,
    pub sheet: ControlSheet,
    pub uids: AtomicU64,
}

impl StageEnv {
    pub fn new() -> Self {
        Self {
            heap: WeakHeap::new(1 << 24),
            sheet: ControlSheet::new(),
            uids: AtomicU64::new(0),
        }
    }

    pub fn setup(&mut self, transform: &mut dyn StageTransform) {
        transform.setup_sheet(&mut self.sheet);
    }

    /// Sets up the transform's sheet and waits for its model to load.
    pub fn setup_and_load(&mut self, transform: &mut dyn StageTransform) {
        transform.setup_sheet(&mut self.sheet);
        self.settle(transform);
    }

    /// Polls lifecycle events until a model reports ready.
    pub fn settle(&mut self, transform: &mut dyn StageTransform) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if transform.poll_events(&mut self.sheet) {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn set(&mut self, transform: &mut dyn StageTransform, cell: &str, value: CellValue) {
        assert!(self.sheet.apply(cell, &value).unwrap());
        transform.on_cell_changed(cell, &mut self.sheet);
    }

    pub fn record(&self, frame: Frame) -> ComputeData {
        let mut record = ComputeData::new(7, frame.index());
        let key = record.heap_key("test", "frame");
        record.frame_image = Some(self.heap.write_frame(&key, frame).unwrap());
        record
    }

    pub fn process(
        &mut self,
        stage: &str,
        transform: &mut dyn StageTransform,
        record: &mut ComputeData,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut ctx = StageContext {
            stage,
            heap: &self.heap,
            sheet: &mut self.sheet,
            uids: &self.uids,
        };
        transform.process(record, &mut ctx)
    }
}

/// Gradient frame, so warps and detections have something to look at.
pub(crate) fn test_frame(width: u32, height: u32) -> Frame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, 128]);
        }
    }
    Frame::new(data, width, height, 3, 0)
}
