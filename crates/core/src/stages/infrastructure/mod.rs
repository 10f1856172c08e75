pub mod builtin_models;
pub mod image_file_source;
pub mod image_sequence_sink;
pub mod model_slot;
pub mod stage_cache;
pub mod warp;
