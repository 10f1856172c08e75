use std::path::{Path, PathBuf};

use crate::shared::constants::IMAGE_EXTENSIONS;
use crate::shared::frame::Frame;
use crate::stages::domain::frame_source::FrameSource;

/// Reads a single image or a directory of images (sorted by file name) as a
/// frame sequence, decoding with the `image` crate.
pub struct ImageFileSource {
    paths: Vec<PathBuf>,
    position: usize,
}

impl ImageFileSource {
    pub fn open(path: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let paths = if path.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| is_image(p))
                .collect();
            paths.sort();
            paths
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            return Err(format!("input not found: {}", path.display()).into());
        };
        if paths.is_empty() {
            return Err(format!("no images in {}", path.display()).into());
        }
        log::info!("Image source {} with {} frame(s)", path.display(), paths.len());
        Ok(Self { paths, position: 0 })
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

impl FrameSource for ImageFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, Box<dyn std::error::Error>> {
        let Some(path) = self.paths.get(self.position) else {
            return Ok(None);
        };
        let index = self.position;
        // Advance first so an undecodable file is skipped on the next call.
        self.position += 1;
        let img = image::open(path)
            .map_err(|e| format!("failed to decode {}: {e}", path.display()))?
            .to_rgb8();
        let (width, height) = img.dimensions();
        Ok(Some(Frame::new(img.into_raw(), width, height, 3, index)))
    }

    fn rewind(&mut self) {
        self.position = 0;
    }

    fn frame_count(&self) -> Option<usize> {
        Some(self.paths.len())
    }
}
