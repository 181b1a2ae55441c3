pub use anyhow::{bail, ensure, Result};
pub use num_traits::{Float, Num, Zero};
pub use std::ops::Mul;
pub use tch::{Device, IndexOp, Kind, Tensor};
