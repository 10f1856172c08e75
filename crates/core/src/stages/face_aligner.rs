use crate::backend::domain::compute_data::ComputeData;
use crate::backend::domain::control_sheet::{ControlSheet, NumberConfig};
use crate::backend::domain::stage_transform::{StageContext, StageTransform};
use crate::shared::face::{AffineMatrix, CANONICAL_LANDMARKS, LANDMARK_COUNT};
use crate::stages::infrastructure::warp::warp_affine;

pub const NAME: &str = "face_aligner";

const RESOLUTION_CELL: &str = "resolution";
const COVERAGE_CELL: &str = "coverage";

/// Canonical landmark positions inside a square crop of `resolution` pixels.
/// Higher `coverage` shrinks the face to include more surrounding context.
pub fn canonical_target(resolution: u32, coverage: f32) -> [(f32, f32); LANDMARK_COUNT] {
    let size = resolution as f32;
    let coverage = coverage.max(f32::EPSILON);
    CANONICAL_LANDMARKS.map(|(u, v)| {
        (
            ((u - 0.5) / coverage + 0.5) * size,
            ((v - 0.5) / coverage + 0.5) * size,
        )
    })
}

/// Warps each landmarked face into an upright square crop.
#[derive(Default)]
pub struct FaceAligner;

impl StageTransform for FaceAligner {
    fn setup_sheet(&mut self, sheet: &mut ControlSheet) {
        let results = [
            sheet.add_number(RESOLUTION_CELL, NumberConfig::new(64.0, 1024.0, 32.0, 0), 224.0),
            sheet.add_number(COVERAGE_CELL, NumberConfig::new(1.0, 4.0, 0.1, 1), 1.6),
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
        if record.faces.iter().all(|f| f.landmarks.is_none()) {
            return Ok(());
        }
        let image = record.frame_image.as_ref().ok_or("record has no source frame")?;
        let frame = ctx.heap.require_frame(image)?;
        let resolution = ctx.sheet.number(RESOLUTION_CELL).unwrap_or(224.0) as u32;
        let coverage = ctx.sheet.number(COVERAGE_CELL).unwrap_or(1.6) as f32;
        let target = canonical_target(resolution, coverage);

        let keys: Vec<String> = (0..record.faces.len())
            .map(|i| record.heap_key(ctx.stage, &format!("face{i}")))
            .collect();
        for (face, key) in record.faces.iter_mut().zip(keys) {
            let Some(landmarks) = &face.landmarks else {
                continue;
            };
            let matrix = AffineMatrix::estimate_similarity(landmarks.points(), &target)
                .ok_or("degenerate landmarks")?;
            let aligned = warp_affine(&frame, &matrix, resolution, resolution)?;
            face.align_matrix = Some(matrix);
            face.aligned_image = Some(ctx.heap.write_frame(&key, aligned)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::domain::compute_data::FaceSwapInfo;
    use crate::backend::domain::control_sheet::CellValue;
    use crate::shared::face::{FaceLandmarks, FaceRect};
    use crate::stages::test_support::{test_frame, StageEnv};
    use approx::assert_relative_eq;

    fn landmarked_face(x: f32, y: f32, size: f32) -> FaceSwapInfo {
        let mut face = FaceSwapInfo::new(FaceRect::new(x, y, size, size));
        face.landmarks = Some(FaceLandmarks::new(
            CANONICAL_LANDMARKS.map(|(u, v)| (x + u * size, y + v * size)),
        ));
        face
    }

    #[test]
    fn test_unit_coverage_target_is_canonical_layout() {
        let target = canonical_target(100, 1.0);
        assert_relative_eq!(target[0].0, CANONICAL_LANDMARKS[0].0 * 100.0, epsilon = 1e-4);
        assert_relative_eq!(target[4].1, CANONICAL_LANDMARKS[4].1 * 100.0, epsilon = 1e-4);
    }

    #[test]
    fn test_larger_coverage_pulls_points_to_center() {
        let tight = canonical_target(100, 1.0);
        let loose = canonical_target(100, 2.0);
        assert!((loose[0].0 - 50.0).abs() < (tight[0].0 - 50.0).abs());
    }

    #[test]
    fn test_aligns_face_into_square_crop() {
        let mut env = StageEnv::new();
        let mut stage = FaceAligner;
        env.setup(&mut stage);
        env.set(&mut stage, RESOLUTION_CELL, CellValue::Number(64.0));
        env.set(&mut stage, COVERAGE_CELL, CellValue::Number(1.0));
        let mut record = env.record(test_frame(128, 128));
        record.faces = vec![landmarked_face(32.0, 32.0, 64.0)];

        env.process(NAME, &mut stage, &mut record).unwrap();

        let face = &record.faces[0];
        let aligned = face.aligned_image.as_ref().unwrap();
        assert_eq!((aligned.width, aligned.height), (64, 64));
        assert_eq!(aligned.key, "7_face_aligner_face0");
        // Frame (32, 32) maps to crop origin at unit scale.
        let (ox, oy) = face.align_matrix.unwrap().transform_point(32.0, 32.0);
        assert_relative_eq!(ox, 0.0, epsilon = 1e-2);
        assert_relative_eq!(oy, 0.0, epsilon = 1e-2);
        let crop = env.heap.read_frame(aligned).unwrap();
        assert_eq!(&crop.data()[0..2], &[32, 32]);
    }

    #[test]
    fn test_faces_without_landmarks_are_skipped() {
        let mut env = StageEnv::new();
        let mut stage = FaceAligner;
        env.setup(&mut stage);
        let mut record = env.record(test_frame(64, 64));
        record.faces = vec![
            FaceSwapInfo::new(FaceRect::new(0.0, 0.0, 10.0, 10.0)),
            landmarked_face(0.0, 0.0, 32.0),
        ];

        env.process(NAME, &mut stage, &mut record).unwrap();

        assert!(record.faces[0].aligned_image.is_none());
        assert!(record.faces[1].aligned_image.is_some());
    }

    #[test]
    fn test_degenerate_landmarks_fail_record() {
        let mut env = StageEnv::new();
        let mut stage = FaceAligner;
        env.setup(&mut stage);
        let mut record = env.record(test_frame(64, 64));
        let mut face = FaceSwapInfo::new(FaceRect::new(0.0, 0.0, 10.0, 10.0));
        face.landmarks = Some(FaceLandmarks::new([(5.0, 5.0); LANDMARK_COUNT]));
        record.faces = vec![face];

        assert!(env.process(NAME, &mut stage, &mut record).is_err());
    }
}
