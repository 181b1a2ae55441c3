//! Safe bounding box types and the batched IoU engine.
//!
//! Every box in this crate follows the (top, left, bottom, right) convention.

mod common;

pub use rect::*;
pub mod rect;

pub use tlbr::*;
pub mod tlbr;

pub use tensor::*;
pub mod tensor;

pub mod prelude {
    pub use crate::rect::{Rect, RectFloat, RectNum};
}
