use std::path::Path;

use crate::backend::domain::compute_data::{ComputeData, FaceSwapInfo};
use crate::backend::domain::control_sheet::{ControlSheet, NumberConfig};
use crate::backend::domain::stage_transform::{StageContext, StageTransform};
use crate::cache::FingerprintBuilder;
use crate::shared::constants::BUILTIN_CENTER_DETECTOR;
use crate::shared::face::FaceRect;
use crate::stages::domain::face_models::FaceDetectorModel;
use crate::stages::infrastructure::builtin_models::CenterFaceDetector;
use crate::stages::infrastructure::model_slot::{ModelEntry, ModelSlot};
use crate::stages::infrastructure::stage_cache::{StageCache, StageCacheConfig};

pub const NAME: &str = "face_detector";

const THRESHOLD_CELL: &str = "threshold";
const MAX_FACES_CELL: &str = "max_faces";

pub type DetectorEntry = ModelEntry<Box<dyn FaceDetectorModel>>;

pub fn default_catalog() -> Vec<DetectorEntry> {
    vec![ModelEntry::builtin(BUILTIN_CENTER_DETECTOR, || {
        Box::new(CenterFaceDetector::default()) as Box<dyn FaceDetectorModel>
    })]
}

/// Finds faces in the source frame. Results are memoized per frame content
/// and parameters, so a re-emitted or repeated frame skips detection.
pub struct FaceDetector {
    model: ModelSlot<Box<dyn FaceDetectorModel>>,
    cache: StageCache,
}

impl FaceDetector {
    pub fn new(catalog: Vec<DetectorEntry>, model_dir: &Path, cache: StageCacheConfig) -> Self {
        Self {
            model: ModelSlot::new(catalog, model_dir),
            cache: StageCache::new(cache),
        }
    }
}

impl StageTransform for FaceDetector {
    fn setup_sheet(&mut self, sheet: &mut ControlSheet) {
        self.model.setup_sheet(sheet);
        let results = [
            sheet.add_number(THRESHOLD_CELL, NumberConfig::new(0.0, 1.0, 0.05, 2), 0.5),
            sheet.add_number(MAX_FACES_CELL, NumberConfig::new(1.0, 16.0, 1.0, 0), 1.0),
        ];
        for result in results {
            if let Err(e) = result {
                log::warn!("{NAME}: {e}");
            }
        }
        self.cache.setup_sheet(sheet);
    }

    fn on_cell_changed(&mut self, cell: &str, sheet: &mut ControlSheet) {
        if !self.model.on_cell_changed(cell, sheet) {
            self.cache.on_cell_changed(cell, sheet);
        }
    }

    fn poll_events(&mut self, sheet: &mut ControlSheet) -> bool {
        self.model.poll(sheet)
    }

    fn process(
        &mut self,
        record: &mut ComputeData,
        ctx: &mut StageContext<'_>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        record.faces.clear();
        let Some(model_name) = self.model.loaded_name().map(str::to_string) else {
            return Ok(());
        };
        let Some(model) = self.model.model_mut() else {
            return Ok(());
        };
        let image = record.frame_image.as_ref().ok_or("record has no source frame")?;
        let frame = ctx.heap.require_frame(image)?;

        let threshold = ctx.sheet.number(THRESHOLD_CELL).unwrap_or(0.5) as f32;
        let max_faces = ctx.sheet.number(MAX_FACES_CELL).unwrap_or(1.0) as usize;
        let fingerprint = FingerprintBuilder::new()
            .write_str(NAME)
            .write_str(&model_name)
            .write_frame(&frame)
            .write_f32(threshold)
            .write_u64(max_faces as u64)
            .finish();

        let rects: Vec<FaceRect> = self.cache.get_or_compute(
            fingerprint,
            || -> Result<Vec<FaceRect>, Box<dyn std::error::Error>> {
                let mut found = model.detect(&frame)?;
                found.retain(|d| d.score >= threshold);
                found.sort_by(|a, b| b.score.total_cmp(&a.score));
                found.truncate(max_faces);
                Ok(found.into_iter().map(|d| d.rect).collect())
            },
        )?;
        record.faces = rects.into_iter().map(FaceSwapInfo::new).collect();
        self.cache.publish(ctx.sheet);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.cache.shutdown();
    }
}
