//! Anchor labeling and regression target computation.

mod assigner;
mod targets;

pub use assigner::*;
pub use targets::*;
