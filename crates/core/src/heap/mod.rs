mod image_ref;
pub mod weak_heap;

pub use image_ref::ImageRef;
pub use weak_heap::{HeapError, HeapStats, WeakHeap};
