use crate::backend::domain::compute_data::ComputeData;
use crate::backend::domain::control_sheet::{ControlSheet, NumberConfig};
use crate::backend::domain::stage_transform::{StageContext, StageTransform};
use crate::stages::infrastructure::warp::paste_face;

pub const NAME: &str = "face_merger";

const OPACITY_CELL: &str = "opacity";

/// Pastes swapped faces back onto the source frame.
#[derive(Default)]
pub struct FaceMerger;

impl StageTransform for FaceMerger {
    fn setup_sheet(&mut self, sheet: &mut ControlSheet) {
        if let Err(e) = sheet.add_number(OPACITY_CELL, NumberConfig::new(0.0, 1.0, 0.05, 2), 1.0) {
            log::warn!("{NAME}: {e}");
        }
    }

    fn process(
        &mut self,
        record: &mut ComputeData,
        ctx: &mut StageContext<'_>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let source = record.frame_image.clone().ok_or("record has no source frame")?;
        let pasteable = record.faces.iter().any(|f| {
            f.swapped_image.is_some() && f.swapped_mask.is_some() && f.align_matrix.is_some()
        });
        if !pasteable {
            record.merged_image = Some(source);
            return Ok(());
        }

        let opacity = ctx.sheet.number(OPACITY_CELL).unwrap_or(1.0) as f32;
        let mut frame = ctx.heap.require_frame(&source)?;
        for face in &record.faces {
            let (Some(swapped), Some(mask), Some(matrix)) =
                (&face.swapped_image, &face.swapped_mask, &face.align_matrix)
            else {
                continue;
            };
            let swapped = ctx.heap.require_frame(swapped)?;
            let mask = ctx.heap.require_frame(mask)?;
            paste_face(&mut frame, &swapped, &mask, matrix, opacity)?;
        }
        let key = record.heap_key(ctx.stage, "merged");
        record.merged_image = Some(ctx.heap.write_frame(&key, frame)?);
        Ok(())
    }
}
