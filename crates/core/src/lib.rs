pub mod backend;
pub mod cache;
pub mod heap;
pub mod pipeline;
pub mod shared;
pub mod stages;
