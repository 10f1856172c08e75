use std::path::Path;

use crate::backend::domain::compute_data::ComputeData;
use crate::backend::domain::control_sheet::{ControlSheet, NumberConfig};
use crate::backend::domain::stage_transform::{StageContext, StageTransform};
use crate::shared::constants::BUILTIN_PASSTHROUGH_ANIMATOR;
use crate::stages::domain::face_models::FaceAnimatorModel;
use crate::stages::infrastructure::builtin_models::{elliptical_mask, PassthroughAnimator};
use crate::stages::infrastructure::model_slot::{ModelEntry, ModelSlot};

pub const NAME: &str = "face_animator";

const POWER_CELL: &str = "relative_power";

pub type AnimatorEntry = ModelEntry<Box<dyn FaceAnimatorModel>>;

pub fn default_catalog() -> Vec<AnimatorEntry> {
    vec![ModelEntry::builtin(BUILTIN_PASSTHROUGH_ANIMATOR, || {
        Box::new(PassthroughAnimator) as Box<dyn FaceAnimatorModel>
    })]
}

/// Alternative to the swapper: drives an animated identity with the motion
/// of each aligned face.
pub struct FaceAnimator {
    model: ModelSlot<Box<dyn FaceAnimatorModel>>,
}

impl FaceAnimator {
    pub fn new(catalog: Vec<AnimatorEntry>, model_dir: &Path) -> Self {
        Self {
            model: ModelSlot::new(catalog, model_dir),
        }
    }
}

impl StageTransform for FaceAnimator {
    fn setup_sheet(&mut self, sheet: &mut ControlSheet) {
        self.model.setup_sheet(sheet);
        if let Err(e) = sheet.add_number(POWER_CELL, NumberConfig::new(0.0, 2.0, 0.05, 2), 1.0) {
            log::warn!("{NAME}: {e}");
        }
    }

    fn on_cell_changed(&mut self, cell: &str, sheet: &mut ControlSheet) {
        self.model.on_cell_changed(cell, sheet);
    }

    fn poll_events(&mut self, sheet: &mut ControlSheet) -> bool {
        self.model.poll(sheet)
    }

    fn process(
        &mut self,
        record: &mut ComputeData,
        ctx: &mut StageContext<'_>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let Some(model) = self.model.model_mut() else {
            return Ok(());
        };
        let power = ctx.sheet.number(POWER_CELL).unwrap_or(1.0) as f32;
        let keys: Vec<(String, String)> = (0..record.faces.len())
            .map(|i| {
                (
                    record.heap_key(ctx.stage, &format!("face{i}")),
                    record.heap_key(ctx.stage, &format!("mask{i}")),
                )
            })
            .collect();
        for (face, (face_key, mask_key)) in record.faces.iter_mut().zip(keys) {
            let Some(driver_ref) = &face.aligned_image else {
                continue;
            };
            let driver = ctx.heap.require_frame(driver_ref)?;
            let animated = model.animate(&driver, power)?;
            let mask = elliptical_mask(animated.width(), animated.height());
            face.swapped_image = Some(ctx.heap.write_frame(&face_key, animated)?);
            face.swapped_mask = Some(ctx.heap.write_frame(&mask_key, mask)?);
        }
        Ok(())
    }
}
