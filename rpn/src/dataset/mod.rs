//! Dataset loading, caching, splitting and batching.

mod batch;
mod cache_loader;
mod dataset_;
mod ground_truth;
mod image_dataset;
mod label;

pub use batch::*;
pub use cache_loader::*;
pub use dataset_::*;
pub use ground_truth::*;
pub use image_dataset::*;
pub use label::*;
