//! Domain errors raised by the proposal pipeline.

use thiserror::Error;

/// Errors that abort the current operation.
///
/// They travel inside [anyhow::Error], so callers recover the kind with
/// `err.downcast_ref::<RpnError>()`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpnError {
    /// A box violates bottom >= top and right >= left.
    #[error("malformed box [{t}, {l}, {b}, {r}]: bottom >= top and right >= left must hold")]
    MalformedBox { t: f64, l: f64, b: f64, r: f64 },
    /// Two components disagree on a tensor dimension, e.g. the anchor count
    /// versus the number of network predictions.
    #[error("shape mismatch in {context}: expect {expect}, but get {actual}")]
    ShapeMismatch {
        context: &'static str,
        expect: i64,
        actual: i64,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RpnError {
    pub fn shape_mismatch(context: &'static str, expect: i64, actual: i64) -> Self {
        Self::ShapeMismatch {
            context,
            expect,
            actual,
        }
    }
}
