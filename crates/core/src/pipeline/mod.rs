pub mod face_swap_pipeline;
pub mod pipeline_config;
pub mod pipeline_logger;

pub use face_swap_pipeline::{FaceSwapPipeline, PipelineError, StageStatus};
pub use pipeline_config::{PipelineConfig, PipelineMode};
