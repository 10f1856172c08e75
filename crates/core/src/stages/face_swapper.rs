use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::domain::compute_data::ComputeData;
use crate::backend::domain::control_sheet::{ControlSheet, NumberConfig};
use crate::backend::domain::stage_transform::{StageContext, StageTransform};
use crate::cache::FingerprintBuilder;
use crate::backend::infrastructure::model_loader::BuildError;
use crate::shared::constants::{
    BUILTIN_IDENTITY_SWAPPER, BUILTIN_TINT_SWAPPER, REFERENCE_FACE_FILE, REFERENCE_FACE_SWAPPER,
};
use crate::shared::frame::Frame;
use crate::stages::domain::face_models::FaceSwapModel;
use crate::shared::model_resolver::ModelSource;
use crate::stages::infrastructure::builtin_models::{
    IdentityFaceSwapper, ReferenceFaceSwapper, TintFaceSwapper,
};
use crate::stages::infrastructure::model_slot::{ModelEntry, ModelSlot};
use crate::stages::infrastructure::stage_cache::{StageCache, StageCacheConfig};

pub const NAME: &str = "face_swapper";

const MORPH_CELL: &str = "morph_factor";

pub type SwapperEntry = ModelEntry<Box<dyn FaceSwapModel>>;

pub fn default_catalog() -> Vec<SwapperEntry> {
    vec![
        ModelEntry::builtin(BUILTIN_TINT_SWAPPER, || {
            Box::new(TintFaceSwapper::default()) as Box<dyn FaceSwapModel>
        }),
        ModelEntry::builtin(BUILTIN_IDENTITY_SWAPPER, || {
            Box::new(IdentityFaceSwapper) as Box<dyn FaceSwapModel>
        }),
    ]
}

/// File-backed swapper: the reference face image is resolved from the model
/// directory, or downloaded from `url` when it is missing there.
pub fn reference_entry(url: Option<String>) -> SwapperEntry {
    ModelEntry {
        name: REFERENCE_FACE_SWAPPER.to_string(),
        source: Some(ModelSource {
            file_name: REFERENCE_FACE_FILE.to_string(),
            url,
            bundled_dir: None,
        }),
        build: Arc::new(
            |path: Option<PathBuf>| -> Result<Box<dyn FaceSwapModel>, BuildError> {
                let path = path.ok_or("reference face has no file")?;
                Ok(Box::new(ReferenceFaceSwapper::open(&path)?))
            },
        ),
    }
}

/// Replaces every aligned face through the selected swap model.
///
/// Swap output is the most expensive step of the pipeline and is memoized in
/// the stage's compute cache, keyed by aligned pixels, model and morph factor.
pub struct FaceSwapper {
    model: ModelSlot<Box<dyn FaceSwapModel>>,
    cache: StageCache,
}

impl FaceSwapper {
    pub fn new(catalog: Vec<SwapperEntry>, model_dir: &Path, cache: StageCacheConfig) -> Self {
        Self {
            model: ModelSlot::new(catalog, model_dir),
            cache: StageCache::new(cache),
        }
    }
}

impl StageTransform for FaceSwapper {
    fn setup_sheet(&mut self, sheet: &mut ControlSheet) {
        self.model.setup_sheet(sheet);
        if let Err(e) = sheet.add_number(MORPH_CELL, NumberConfig::new(0.0, 1.0, 0.05, 2), 0.75) {
            log::warn!("{NAME}: {e}");
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
        let Some(model_name) = self.model.loaded_name().map(str::to_string) else {
            return Ok(());
        };
        let Some(model) = self.model.model_mut() else {
            return Ok(());
        };
        let morph = ctx.sheet.number(MORPH_CELL).unwrap_or(0.75) as f32;

        let keys: Vec<(String, String)> = (0..record.faces.len())
            .map(|i| {
                (
                    record.heap_key(ctx.stage, &format!("face{i}")),
                    record.heap_key(ctx.stage, &format!("mask{i}")),
                )
            })
            .collect();
        for (face, (face_key, mask_key)) in record.faces.iter_mut().zip(keys) {
            let Some(aligned_ref) = &face.aligned_image else {
                continue;
            };
            let aligned = ctx.heap.require_frame(aligned_ref)?;
            let fingerprint = FingerprintBuilder::new()
                .write_str(NAME)
                .write_str(&model_name)
                .write_frame(&aligned)
                .write_f32(morph)
                .finish();
            let (swapped, mask): (Frame, Frame) = self.cache.get_or_compute(fingerprint, || {
                model.swap(&aligned, morph)
            })?;
            face.swapped_image = Some(ctx.heap.write_frame(&face_key, swapped)?);
            face.swapped_mask = Some(ctx.heap.write_frame(&mask_key, mask)?);
        }
        self.cache.publish(ctx.sheet);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.cache.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::domain::compute_data::FaceSwapInfo;
    use crate::backend::domain::control_sheet::CellValue;
    use crate::cache::CacheConfig;
    use crate::shared::face::FaceRect;
    use crate::stages::infrastructure::model_slot::{MODEL_CELL, MODEL_ERROR_CELL};
    use crate::stages::infrastructure::stage_cache::CACHED_CELL;
    use crate::stages::test_support::StageEnv;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSwapper {
        calls: Arc<AtomicUsize>,
    }

    impl FaceSwapModel for CountingSwapper {
        fn swap(
            &mut self,
            aligned: &Frame,
            _morph: f32,
        ) -> Result<(Frame, Frame), Box<dyn std::error::Error>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok((
                Frame::filled(aligned.width(), aligned.height(), 3, 255),
                Frame::filled(aligned.width(), aligned.height(), 1, 255),
            ))
        }
    }

    fn cache_config(mapped_threshold: usize) -> StageCacheConfig {
        StageCacheConfig {
            cache: CacheConfig {
                max_bytes: 1 << 20,
                ceiling: 1 << 20,
                mapped_threshold,
                spill_dir: None,
            },
            monitor: false,
        }
    }

    fn swapper(calls: Arc<AtomicUsize>, mapped_threshold: usize) -> FaceSwapper {
        let catalog = vec![ModelEntry::builtin("counting", move || {
            Box::new(CountingSwapper {
                calls: calls.clone(),
            }) as Box<dyn FaceSwapModel>
        })];
        FaceSwapper::new(catalog, &std::env::temp_dir(), cache_config(mapped_threshold))
    }

    fn record_with_aligned_face(env: &StageEnv) -> ComputeData {
        let mut record = ComputeData::new(3, 0);
        let mut face = FaceSwapInfo::new(FaceRect::new(0.0, 0.0, 16.0, 16.0));
        face.aligned_image = Some(
            env.heap
                .write_frame("3_face_aligner_face0", Frame::filled(16, 16, 3, 60))
                .unwrap(),
        );
        record.faces = vec![face];
        record
    }

    #[test]
    fn test_swaps_aligned_faces_into_heap() {
        let mut env = StageEnv::new();
        let mut stage = swapper(Arc::new(AtomicUsize::new(0)), usize::MAX);
        env.setup_and_load(&mut stage);
        let mut record = record_with_aligned_face(&env);

        env.process(NAME, &mut stage, &mut record).unwrap();

        let face = &record.faces[0];
        let swapped = env.heap.read_frame(face.swapped_image.as_ref().unwrap()).unwrap();
        let mask = env.heap.read_frame(face.swapped_mask.as_ref().unwrap()).unwrap();
        assert_eq!(swapped.data()[0], 255);
        assert_eq!(mask.channels(), 1);
        assert_eq!(face.swapped_image.as_ref().unwrap().key, "3_face_swapper_face0");
    }

    #[rstest]
    #[case::in_process(usize::MAX)]
    #[case::mapped(64)]
    fn test_same_aligned_face_is_swapped_once(#[case] mapped_threshold: usize) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut env = StageEnv::new();
        let mut stage = swapper(calls.clone(), mapped_threshold);
        env.setup_and_load(&mut stage);

        for _ in 0..3 {
            let mut record = record_with_aligned_face(&env);
            env.process(NAME, &mut stage, &mut record).unwrap();
            assert!(record.faces[0].swapped_image.is_some());
        }

        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_morph_change_recomputes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut env = StageEnv::new();
        let mut stage = swapper(calls.clone(), usize::MAX);
        env.setup_and_load(&mut stage);

        let mut record = record_with_aligned_face(&env);
        env.process(NAME, &mut stage, &mut record).unwrap();
        env.set(&mut stage, MORPH_CELL, CellValue::Number(0.2));
        env.process(NAME, &mut stage, &mut record).unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_cache_toggle_off_recomputes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut env = StageEnv::new();
        let mut stage = swapper(calls.clone(), usize::MAX);
        env.setup_and_load(&mut stage);
        env.set(&mut stage, CACHED_CELL, CellValue::Flag(false));

        let mut record = record_with_aligned_face(&env);
        env.process(NAME, &mut stage, &mut record).unwrap();
        env.process(NAME, &mut stage, &mut record).unwrap();

        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_passes_through_while_model_missing() {
        let mut env = StageEnv::new();
        let mut stage = FaceSwapper::new(Vec::new(), &std::env::temp_dir(), cache_config(usize::MAX));
        env.setup(&mut stage);
        let mut record = record_with_aligned_face(&env);

        env.process(NAME, &mut stage, &mut record).unwrap();

        assert!(record.faces[0].swapped_image.is_none());
        assert!(env.sheet.selected(MODEL_CELL).is_none());
        assert!(env.sheet.error(MODEL_ERROR_CELL).is_none());
    }

    #[test]
    fn test_reference_face_resolves_from_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        image::RgbImage::from_pixel(8, 8, image::Rgb([200, 200, 200]))
            .save(dir.path().join(REFERENCE_FACE_FILE))
            .unwrap();
        let mut env = StageEnv::new();
        let mut stage = FaceSwapper::new(
            vec![reference_entry(None)],
            dir.path(),
            cache_config(usize::MAX),
        );
        env.setup_and_load(&mut stage);
        let mut record = record_with_aligned_face(&env);

        env.process(NAME, &mut stage, &mut record).unwrap();

        let face = &record.faces[0];
        let swapped = env.heap.read_frame(face.swapped_image.as_ref().unwrap()).unwrap();
        // Default morph 0.75 between 60 and 200.
        assert_eq!(swapped.data()[0], 165);
    }

    #[test]
    fn test_reference_face_missing_without_url_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = StageEnv::new();
        let mut stage = FaceSwapper::new(
            vec![reference_entry(None)],
            dir.path(),
            cache_config(usize::MAX),
        );
        env.setup(&mut stage);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while env.sheet.error(MODEL_ERROR_CELL).is_none() && std::time::Instant::now() < deadline {
            stage.poll_events(&mut env.sheet);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert!(env.sheet.error(MODEL_ERROR_CELL).unwrap().contains(REFERENCE_FACE_FILE));
        let mut record = record_with_aligned_face(&env);
        env.process(NAME, &mut stage, &mut record).unwrap();
        assert!(record.faces[0].swapped_image.is_none());
    }

    #[test]
    fn test_builtin_catalog_lists_both_swappers() {
        let names: Vec<String> = default_catalog().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec![BUILTIN_TINT_SWAPPER, BUILTIN_IDENTITY_SWAPPER]);
    }
}
