//! The frozen feature backbone and the attention-augmented proposal head.

mod backbone;
mod cbam;
mod rpn_head;

pub use backbone::*;
pub use cbam::*;
pub use rpn_head::*;
