//! Region proposal network with CBAM attention, and the anchor machinery
//! that trains it.
//!
//! The crate is organized leaves first:
//!
//! - [anchor] lays out the dense anchor grid over a feature map.
//! - [target] labels anchors against ground truth and samples training examples.
//! - [codec] converts between boxes and anchor-relative regression deltas.
//! - [model] hosts the frozen backbone and the attention-augmented proposal head.
//! - [loss] and [metric] turn network outputs into a training signal and a recall score.
//! - [dataset] loads images, labels and batches.

mod common;
pub mod anchor;
pub mod codec;
pub mod dataset;
pub mod error;
pub mod loss;
pub mod metric;
pub mod model;
pub mod target;

pub use error::RpnError;
