use crate::heap::ImageRef;
use crate::shared::face::{AffineMatrix, FaceLandmarks, FaceRect};

/// Per-face metadata accumulated as a record moves downstream.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceSwapInfo {
    pub rect: FaceRect,
    pub landmarks: Option<FaceLandmarks>,
    /// Frame space -> aligned face space.
    pub align_matrix: Option<AffineMatrix>,
    pub aligned_image: Option<ImageRef>,
    pub swapped_image: Option<ImageRef>,
    pub swapped_mask: Option<ImageRef>,
}

impl FaceSwapInfo {
    pub fn new(rect: FaceRect) -> Self {
        Self {
            rect,
            landmarks: None,
            align_matrix: None,
            aligned_image: None,
            swapped_image: None,
            swapped_mask: None,
        }
    }
}

/// Message flowing through connections. Holds heap references only, never pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct ComputeData {
    uid: u64,
    frame_index: usize,
    pub frame_image: Option<ImageRef>,
    pub merged_image: Option<ImageRef>,
    pub faces: Vec<FaceSwapInfo>,
}

impl ComputeData {
    pub fn new(uid: u64, frame_index: usize) -> Self {
        Self {
            uid,
            frame_index,
            frame_image: None,
            merged_image: None,
            faces: Vec::new(),
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Copy of this record under a new uid, keeping only the source frame.
    ///
    /// Used to re-emit a frame: downstream stages then write fresh heap keys
    /// instead of overwriting the ones produced for the original pass.
    pub fn reissue(&self, uid: u64) -> Self {
        Self {
            uid,
            frame_index: self.frame_index,
            frame_image: self.frame_image.clone(),
            merged_image: None,
            faces: Vec::new(),
        }
    }

    /// Heap key for an image produced by `stage` for this record.
    pub fn heap_key(&self, stage: &str, suffix: &str) -> String {
        format!("{}_{stage}_{suffix}", self.uid)
    }

    /// Every heap key this record references.
    pub fn image_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        keys.extend(self.frame_image.iter().map(|i| i.key.as_str()));
        keys.extend(self.merged_image.iter().map(|i| i.key.as_str()));
        for face in &self.faces {
            for image in [&face.aligned_image, &face.swapped_image, &face.swapped_mask]
                .into_iter()
                .flatten()
            {
                keys.push(image.key.as_str());
            }
        }
        keys
    }

    /// The merged image if present, otherwise the source frame.
    pub fn output_image(&self) -> Option<&ImageRef> {
        self.merged_image.as_ref().or(self.frame_image.as_ref())
    }
}
