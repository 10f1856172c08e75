use crate::heap::weak_heap::{HeapError, WeakHeap};
use crate::shared::frame::Frame;

/// Reference to an image stored in the weak heap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    pub key: String,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl WeakHeap {
    /// Moves the frame's pixels into the heap under `key`.
    pub fn write_frame(&self, key: &str, frame: Frame) -> Result<ImageRef, HeapError> {
        let image = ImageRef {
            key: key.to_string(),
            width: frame.width(),
            height: frame.height(),
            channels: frame.channels(),
        };
        self.write(key, frame.into_data())?;
        Ok(image)
    }

    /// Copies the referenced image out of the heap.
    ///
    /// Returns `None` on a miss or when the stored length no longer matches
    /// the reference (the key was overwritten with a different image).
    pub fn read_frame(&self, image: &ImageRef) -> Option<Frame> {
        let bytes = self.read(&image.key)?;
        let expected = Frame::expected_len(image.width, image.height, image.channels);
        if bytes.len() != expected {
            log::warn!(
                "Heap entry {} has {} bytes, expected {expected}",
                image.key,
                bytes.len()
            );
            return None;
        }
        Some(Frame::new(
            bytes.to_vec(),
            image.width,
            image.height,
            image.channels,
            0,
        ))
    }

    /// Like [`read_frame`](Self::read_frame), but a miss is an error.
    ///
    /// Workers treat [`HeapError::Missing`] as an evicted frame and skip the
    /// record without reporting it.
    pub fn require_frame(&self, image: &ImageRef) -> Result<Frame, HeapError> {
        self.read_frame(image)
            .ok_or_else(|| HeapError::Missing(image.key.clone()))
    }
}
