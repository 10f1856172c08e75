use crate::shared::frame::Frame;

/// Produces source frames for the pipeline.
pub trait FrameSource: Send {
    /// Next frame, or `None` at the end of the source.
    fn next_frame(&mut self) -> Result<Option<Frame>, Box<dyn std::error::Error>>;

    /// Restarts from the first frame.
    fn rewind(&mut self);

    /// Total frame count when known.
    fn frame_count(&self) -> Option<usize> {
        None
    }
}
