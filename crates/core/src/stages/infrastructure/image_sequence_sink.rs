use std::path::{Path, PathBuf};

use crate::shared::frame::Frame;
use crate::stages::domain::frame_sink::FrameSink;

/// Writes each frame as `frame_{index:06}.png` into a directory.
/// A re-emitted frame overwrites the file of the same index.
pub struct ImageSequenceSink {
    dir: PathBuf,
    written: usize,
}

impl ImageSequenceSink {
    pub fn create(dir: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            written: 0,
        })
    }

    pub fn written(&self) -> usize {
        self.written
    }

    fn frame_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("frame_{index:06}.png"))
    }
}

impl FrameSink for ImageSequenceSink {
    fn write(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        if frame.channels() != 3 {
            return Err(format!("expected RGB frame, got {} channels", frame.channels()).into());
        }
        let img = image::RgbImage::from_raw(frame.width(), frame.height(), frame.data().to_vec())
            .ok_or("Failed to create image from frame data")?;
        img.save(self.frame_path(frame.index()))?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        log::info!("Wrote {} frame(s) to {}", self.written, self.dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_names_file_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ImageSequenceSink::create(&dir.path().join("out")).unwrap();
        let frame = Frame::filled(4, 3, 3, 120).with_index(7);

        sink.write(&frame).unwrap();

        let img = image::open(dir.path().join("out/frame_000007.png"))
            .unwrap()
            .to_rgb8();
        assert_eq!(img.dimensions(), (4, 3));
        assert_eq!(img.get_pixel(0, 0).0, [120, 120, 120]);
        assert_eq!(sink.written(), 1);
    }

    #[test]
    fn test_rejects_non_rgb_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ImageSequenceSink::create(dir.path()).unwrap();
        assert!(sink.write(&Frame::filled(2, 2, 1, 0)).is_err());
    }
}
