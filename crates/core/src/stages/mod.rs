pub mod domain;
pub mod face_aligner;
pub mod face_animator;
pub mod face_detector;
pub mod face_marker;
pub mod face_merger;
pub mod face_swapper;
pub mod file_source;
pub mod frame_adjuster;
pub mod infrastructure;
pub mod stream_output;

#[cfg(test)]
pub(crate) mod test_support;
