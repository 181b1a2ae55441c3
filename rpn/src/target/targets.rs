use crate::{common::*, error::RpnError};

/// Label of anchors excluded from the loss.
pub const LABEL_IGNORE: i64 = -1;
/// Label of background anchors.
pub const LABEL_NEGATIVE: i64 = 0;
/// Label of object anchors.
pub const LABEL_POSITIVE: i64 = 1;

/// Training targets of every anchor of one image.
#[derive(Debug)]
pub struct AnchorTargets {
    /// Labels in shape `[num_anchors]` of kind int64.
    pub labels: Tensor,
    /// Regression targets in shape `[num_anchors, 4]`. Rows of non-positive
    /// anchors are zero.
    pub locs: Tensor,
}

impl AnchorTargets {
    pub fn num_anchors(&self) -> i64 {
        self.labels.size()[0]
    }

    pub fn count(&self, label: i64) -> i64 {
        i64::from(self.labels.eq(label).sum(Kind::Int64))
    }

    pub fn num_positives(&self) -> i64 {
        self.count(LABEL_POSITIVE)
    }

    pub fn num_negatives(&self) -> i64 {
        self.count(LABEL_NEGATIVE)
    }
}

/// Anchor targets of a batch, stacked along the first dimension.
#[derive(Debug)]
pub struct BatchTargets {
    /// Labels in shape `[batch, num_anchors]`.
    pub labels: Tensor,
    /// Regression targets in shape `[batch, num_anchors, 4]`.
    pub locs: Tensor,
}

impl BatchTargets {
    pub fn stack(targets: &[AnchorTargets]) -> Result<Self> {
        ensure!(!targets.is_empty(), "cannot stack an empty batch of targets");

        let num_anchors = targets[0].num_anchors();
        if let Some(other) = targets.iter().find(|t| t.num_anchors() != num_anchors) {
            return Err(RpnError::shape_mismatch(
                "batch targets",
                num_anchors,
                other.num_anchors(),
            )
            .into());
        }

        let labels: Vec<_> = targets.iter().map(|t| &t.labels).collect();
        let locs: Vec<_> = targets.iter().map(|t| &t.locs).collect();

        Ok(Self {
            labels: Tensor::stack(&labels, 0),
            locs: Tensor::stack(&locs, 0),
        })
    }

    pub fn batch_size(&self) -> i64 {
        self.labels.size()[0]
    }

    pub fn num_anchors(&self) -> i64 {
        self.labels.size()[1]
    }
}
