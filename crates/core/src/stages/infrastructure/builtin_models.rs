//! Reference models that need no weights file. They keep the pipeline
//! runnable end to end without an inference engine.

use std::path::Path;

use crate::backend::infrastructure::model_loader::BuildError;
use crate::shared::face::{FaceLandmarks, FaceRect, CANONICAL_LANDMARKS};
use crate::shared::frame::Frame;
use crate::stages::domain::face_models::{
    Detection, FaceAnimatorModel, FaceDetectorModel, FaceMarkerModel, FaceSwapModel,
};

/// Reports one face centered in the frame, sized by `scale` of the shorter side.
pub struct CenterFaceDetector {
    scale: f32,
}

impl CenterFaceDetector {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }
}

impl Default for CenterFaceDetector {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl FaceDetectorModel for CenterFaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, Box<dyn std::error::Error>> {
        let side = frame.width().min(frame.height()) as f32 * self.scale;
        if side < 1.0 {
            return Ok(Vec::new());
        }
        let x = (frame.width() as f32 - side) / 2.0;
        let y = (frame.height() as f32 - side) / 2.0;
        Ok(vec![Detection {
            rect: FaceRect::new(x, y, side, side),
            score: 1.0,
        }])
    }
}

/// Places the canonical frontal landmark layout inside the face rect.
pub struct CanonicalFaceMarker;

impl FaceMarkerModel for CanonicalFaceMarker {
    fn mark(
        &mut self,
        _frame: &Frame,
        rect: &FaceRect,
    ) -> Result<FaceLandmarks, Box<dyn std::error::Error>> {
        let points =
            CANONICAL_LANDMARKS.map(|(u, v)| (rect.x + u * rect.width, rect.y + v * rect.height));
        Ok(FaceLandmarks::new(points))
    }
}

/// Soft elliptical mask: 255 inside, fading to 0 at the crop edge.
pub fn elliptical_mask(width: u32, height: u32) -> Frame {
    let mut mask = Frame::filled(width, height, 1, 0);
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let rx = (width as f32 / 2.0).max(1.0);
    let ry = (height as f32 / 2.0).max(1.0);
    let data = mask.data_mut();
    for y in 0..height {
        for x in 0..width {
            let dx = (x as f32 - cx) / rx;
            let dy = (y as f32 - cy) / ry;
            let d = (dx * dx + dy * dy).sqrt();
            // Full weight inside 70% of the radius, linear falloff to the edge.
            let weight = ((1.0 - d) / 0.3).clamp(0.0, 1.0);
            data[(y * width + x) as usize] = (weight * 255.0).round() as u8;
        }
    }
    mask
}

/// Blends the aligned face toward a fixed color by the morph factor.
pub struct TintFaceSwapper {
    tint: [u8; 3],
}

impl TintFaceSwapper {
    pub fn new(tint: [u8; 3]) -> Self {
        Self { tint }
    }
}

impl Default for TintFaceSwapper {
    fn default() -> Self {
        Self::new([224, 172, 140])
    }
}

impl FaceSwapModel for TintFaceSwapper {
    fn swap(
        &mut self,
        aligned: &Frame,
        morph: f32,
    ) -> Result<(Frame, Frame), Box<dyn std::error::Error>> {
        let morph = morph.clamp(0.0, 1.0);
        let channels = aligned.channels() as usize;
        let mut swapped = aligned.clone();
        for (i, v) in swapped.data_mut().iter_mut().enumerate() {
            let target = self.tint[(i % channels).min(2)] as f32;
            *v = (*v as f32 * (1.0 - morph) + target * morph).round() as u8;
        }
        let mask = elliptical_mask(aligned.width(), aligned.height());
        Ok((swapped, mask))
    }
}

/// Blends a fixed reference face, loaded from an image file, over the
/// aligned face by the morph factor.
pub struct ReferenceFaceSwapper {
    reference: Frame,
}

impl ReferenceFaceSwapper {
    pub fn new(reference: Frame) -> Self {
        Self { reference }
    }

    pub fn open(path: &Path) -> Result<Self, BuildError> {
        let img = image::open(path)
            .map_err(|e| format!("failed to decode {}: {e}", path.display()))?
            .to_rgb8();
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(format!("{} is empty", path.display()).into());
        }
        Ok(Self::new(Frame::new(img.into_raw(), width, height, 3, 0)))
    }
}

impl FaceSwapModel for ReferenceFaceSwapper {
    fn swap(
        &mut self,
        aligned: &Frame,
        morph: f32,
    ) -> Result<(Frame, Frame), Box<dyn std::error::Error>> {
        let morph = morph.clamp(0.0, 1.0);
        let channels = aligned.channels() as usize;
        let ref_channels = self.reference.channels() as usize;
        let sx = self.reference.width() as f32 / aligned.width().max(1) as f32;
        let sy = self.reference.height() as f32 / aligned.height().max(1) as f32;
        let max_x = self.reference.width() as f32 - 1.0;
        let max_y = self.reference.height() as f32 - 1.0;

        let mut swapped = aligned.clone();
        let width = aligned.width() as usize;
        for (i, v) in swapped.data_mut().iter_mut().enumerate() {
            let pixel = i / channels;
            let (x, y) = ((pixel % width) as f32, (pixel / width) as f32);
            let rx = ((x + 0.5) * sx - 0.5).clamp(0.0, max_x);
            let ry = ((y + 0.5) * sy - 0.5).clamp(0.0, max_y);
            let c = (i % channels).min(ref_channels - 1);
            let target = self.reference.sample_bilinear(rx, ry, c).unwrap_or(*v as f32);
            *v = (*v as f32 * (1.0 - morph) + target * morph).round().clamp(0.0, 255.0) as u8;
        }
        let mask = elliptical_mask(aligned.width(), aligned.height());
        Ok((swapped, mask))
    }
}

/// Returns the aligned face unchanged.
pub struct IdentityFaceSwapper;

impl FaceSwapModel for IdentityFaceSwapper {
    fn swap(
        &mut self,
        aligned: &Frame,
        _morph: f32,
    ) -> Result<(Frame, Frame), Box<dyn std::error::Error>> {
        Ok((
            aligned.clone(),
            elliptical_mask(aligned.width(), aligned.height()),
        ))
    }
}

/// Returns the driver face scaled toward mid-gray by `power`.
pub struct PassthroughAnimator;

impl FaceAnimatorModel for PassthroughAnimator {
    fn animate(
        &mut self,
        driver: &Frame,
        power: f32,
    ) -> Result<Frame, Box<dyn std::error::Error>> {
        let power = power.clamp(0.0, 2.0);
        let mut out = driver.clone();
        for v in out.data_mut() {
            *v = (128.0 + (*v as f32 - 128.0) * power).round().clamp(0.0, 255.0) as u8;
        }
        Ok(out)
    }
}
