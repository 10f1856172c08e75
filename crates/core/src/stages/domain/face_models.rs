//! Opaque per-frame model interfaces. Inference internals live behind these
//! traits; stages only see frames in and geometry or frames out.

use crate::shared::face::{FaceLandmarks, FaceRect};
use crate::shared::frame::Frame;

/// A scored face rectangle in frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub rect: FaceRect,
    pub score: f32,
}

/// Implementations may keep state between frames, hence `&mut self`.
pub trait FaceDetectorModel: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, Box<dyn std::error::Error>>;
}

pub trait FaceMarkerModel: Send {
    /// Five landmarks for the face inside `rect`, in frame coordinates.
    fn mark(
        &mut self,
        frame: &Frame,
        rect: &FaceRect,
    ) -> Result<FaceLandmarks, Box<dyn std::error::Error>>;
}

pub trait FaceSwapModel: Send {
    /// Returns the swapped face and a single-channel blend mask, both at the
    /// aligned face's resolution. `morph` is in `0.0..=1.0`.
    fn swap(
        &mut self,
        aligned: &Frame,
        morph: f32,
    ) -> Result<(Frame, Frame), Box<dyn std::error::Error>>;
}

pub trait FaceAnimatorModel: Send {
    /// Animates the model's source identity with the motion of `driver`.
    fn animate(
        &mut self,
        driver: &Frame,
        power: f32,
    ) -> Result<Frame, Box<dyn std::error::Error>>;
}
