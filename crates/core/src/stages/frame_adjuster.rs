use crate::backend::domain::compute_data::ComputeData;
use crate::backend::domain::control_sheet::{ControlSheet, NumberConfig};
use crate::backend::domain::stage_transform::{StageContext, StageTransform};
use crate::shared::frame::Frame;

pub const NAME: &str = "frame_adjuster";

const BRIGHTNESS_CELL: &str = "brightness";
const CONTRAST_CELL: &str = "contrast";

/// `out = (v - 128) * contrast + 128 + brightness`, clamped to `0..=255`.
pub fn adjust(frame: &mut Frame, brightness: f32, contrast: f32) {
    frame.as_ndarray_mut().mapv_inplace(|v| {
        ((v as f32 - 128.0) * contrast + 128.0 + brightness)
            .round()
            .clamp(0.0, 255.0) as u8
    });
}

/// Color-corrects swapped faces before they are merged.
#[derive(Default)]
pub struct FrameAdjuster;

impl StageTransform for FrameAdjuster {
    fn setup_sheet(&mut self, sheet: &mut ControlSheet) {
        let results = [
            sheet.add_number(BRIGHTNESS_CELL, NumberConfig::new(-100.0, 100.0, 1.0, 0), 0.0),
            sheet.add_number(CONTRAST_CELL, NumberConfig::new(0.0, 3.0, 0.05, 2), 1.0),
        ];
        for result in results {
            if let Err(e) = result {
                log::warn!("{NAME}: {e}");
            }
        }
    }

    fn process(
        &mut self,
        record: &mut ComputeData,
        ctx: &mut StageContext<'_>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let brightness = ctx.sheet.number(BRIGHTNESS_CELL).unwrap_or(0.0) as f32;
        let contrast = ctx.sheet.number(CONTRAST_CELL).unwrap_or(1.0) as f32;
        if brightness == 0.0 && contrast == 1.0 {
            return Ok(());
        }
        let keys: Vec<String> = (0..record.faces.len())
            .map(|i| record.heap_key(ctx.stage, &format!("face{i}")))
            .collect();
        for (face, key) in record.faces.iter_mut().zip(keys) {
            let Some(swapped) = &face.swapped_image else {
                continue;
            };
            let mut frame = ctx.heap.require_frame(swapped)?;
            adjust(&mut frame, brightness, contrast);
            face.swapped_image = Some(ctx.heap.write_frame(&key, frame)?);
        }
        Ok(())
    }
}
