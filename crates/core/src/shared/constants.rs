pub const MIB: usize = 1024 * 1024;

pub const DEFAULT_HEAP_CAPACITY: usize = 512 * MIB;

pub const DEFAULT_CACHE_BUDGET: usize = 256 * MIB;
pub const DEFAULT_CACHE_CEILING: usize = 1024 * MIB;
pub const DEFAULT_CACHE_FLOOR: usize = 16 * MIB;
/// Cache entries at or above this size go to the memory-mapped tier.
pub const DEFAULT_MAPPED_THRESHOLD: usize = 10 * MIB;

/// Input read timeout; sets pipeline cadence.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5;
pub const DEFAULT_BACKOFF_MS: u64 = 1;
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_CONNECTION_CAPACITY: usize = 1;
pub const DEFAULT_SOURCE_FPS: f64 = 30.0;

/// Memory utilization above which the cache budget shrinks.
pub const MEMORY_HIGH_WATERMARK: f64 = 0.85;
/// Memory utilization below which the cache budget grows.
pub const MEMORY_LOW_WATERMARK: f64 = 0.60;
pub const BUDGET_STEP_FRACTION: f64 = 0.2;
pub const RESOURCE_MONITOR_INTERVAL_MS: u64 = 1000;

pub const BUILTIN_CENTER_DETECTOR: &str = "builtin-center";
pub const BUILTIN_CANONICAL_MARKER: &str = "builtin-canonical";
pub const BUILTIN_TINT_SWAPPER: &str = "builtin-tint";
pub const BUILTIN_IDENTITY_SWAPPER: &str = "builtin-identity";
pub const REFERENCE_FACE_SWAPPER: &str = "reference-face";
/// Looked up in the model directory, downloaded from the configured URL otherwise.
pub const REFERENCE_FACE_FILE: &str = "reference_face.png";
pub const BUILTIN_PASSTHROUGH_ANIMATOR: &str = "builtin-passthrough";

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp"];

pub const APP_DIR_NAME: &str = "FaceLive";
pub const BACKEND_DB_FILENAME: &str = "backend_db.json";
