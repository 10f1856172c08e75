use std::path::Path;

use crate::backend::domain::compute_data::ComputeData;
use crate::backend::domain::control_sheet::ControlSheet;
use crate::backend::domain::stage_transform::{StageContext, StageTransform};
use crate::shared::constants::BUILTIN_CANONICAL_MARKER;
use crate::stages::domain::face_models::FaceMarkerModel;
use crate::stages::infrastructure::builtin_models::CanonicalFaceMarker;
use crate::stages::infrastructure::model_slot::{ModelEntry, ModelSlot};

pub const NAME: &str = "face_marker";

pub type MarkerEntry = ModelEntry<Box<dyn FaceMarkerModel>>;

pub fn default_catalog() -> Vec<MarkerEntry> {
    vec![ModelEntry::builtin(BUILTIN_CANONICAL_MARKER, || {
        Box::new(CanonicalFaceMarker) as Box<dyn FaceMarkerModel>
    })]
}

/// Adds five landmarks to every detected face.
pub struct FaceMarker {
    model: ModelSlot<Box<dyn FaceMarkerModel>>,
}

impl FaceMarker {
    pub fn new(catalog: Vec<MarkerEntry>, model_dir: &Path) -> Self {
        Self {
            model: ModelSlot::new(catalog, model_dir),
        }
    }
}

impl StageTransform for FaceMarker {
    fn setup_sheet(&mut self, sheet: &mut ControlSheet) {
        self.model.setup_sheet(sheet);
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
        if record.faces.is_empty() {
            return Ok(());
        }
        let Some(model) = self.model.model_mut() else {
            return Ok(());
        };
        let image = record.frame_image.as_ref().ok_or("record has no source frame")?;
        let frame = ctx.heap.require_frame(image)?;
        for face in &mut record.faces {
            face.landmarks = Some(model.mark(&frame, &face.rect)?);
        }
        Ok(())
    }
}
