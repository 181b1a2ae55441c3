//! Classification and regression loss of the proposal head.

use crate::{
    common::*,
    error::RpnError,
    model::RpnOutput,
    target::{BatchTargets, LABEL_IGNORE, LABEL_POSITIVE},
};

pub use rpn_loss::*;
pub use rpn_loss_output::*;

mod rpn_loss {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct RpnLossInit {
        /// Weight of the regression term in the total loss.
        #[serde(default = "default_loss_weight")]
        pub loss_weight: R64,
    }

    impl Default for RpnLossInit {
        fn default() -> Self {
            Self {
                loss_weight: default_loss_weight(),
            }
        }
    }

    fn default_loss_weight() -> R64 {
        r64(10.0)
    }

    impl RpnLossInit {
        pub fn build(self) -> Result<RpnLoss> {
            let Self { loss_weight } = self;
            if loss_weight.raw() < 0.0 {
                return Err(RpnError::InvalidConfig(format!(
                    "loss_weight must be non-negative, but get {}",
                    loss_weight
                ))
                .into());
            }
            Ok(RpnLoss {
                loss_weight: loss_weight.raw(),
            })
        }
    }

    /// Cross entropy over labeled anchors plus weighted smooth L1 over positives.
    #[derive(Debug)]
    pub struct RpnLoss {
        loss_weight: f64,
    }

    impl RpnLoss {
        pub fn loss_weight(&self) -> f64 {
            self.loss_weight
        }

        pub fn forward(&self, prediction: &RpnOutput, targets: &BatchTargets) -> Result<RpnLossOutput> {
            let RpnOutput { deltas, logits, .. } = prediction;
            let BatchTargets { labels, locs } = targets;

            let (batch_size, num_anchors, _) = deltas.size3()?;
            if targets.batch_size() != batch_size {
                return Err(RpnError::shape_mismatch(
                    "loss batch size",
                    batch_size,
                    targets.batch_size(),
                )
                .into());
            }
            if targets.num_anchors() != num_anchors {
                return Err(RpnError::shape_mismatch(
                    "loss anchor count",
                    num_anchors,
                    targets.num_anchors(),
                )
                .into());
            }

            let device = deltas.device();
            let labels = labels.to_device(device).view([-1]);
            let locs = locs.to_device(device).view([-1, 4]);
            let deltas = deltas.view([-1, 4]);
            let logits = logits.view([-1, 2]);

            // classification over labeled anchors
            let labeled = labels.ne(LABEL_IGNORE).nonzero().view([-1]);
            let num_labeled = labeled.size()[0];
            let classification_loss = if num_labeled > 0 {
                logits
                    .index_select(0, &labeled)
                    .cross_entropy_for_logits(&labels.index_select(0, &labeled))
            } else {
                // zero, but still attached to the graph
                logits.sum(Kind::Float) * 0.0
            };

            // regression over positives
            let positives = labels.eq(LABEL_POSITIVE).nonzero().view([-1]);
            let num_positives = positives.size()[0];
            let regression_loss = if num_positives > 0 {
                let diff = (deltas.index_select(0, &positives)
                    - locs.index_select(0, &positives))
                .abs();
                let clipped = diff.clamp_max(1.0);
                let smooth_l1 = clipped.square() * 0.5 + (&diff - &clipped);
                smooth_l1.sum(Kind::Float) / num_positives as f64
            } else {
                deltas.sum(Kind::Float) * 0.0
            };

            let weighted_regression_loss = &regression_loss * self.loss_weight;
            let total_loss = &classification_loss + &weighted_regression_loss;

            Ok(RpnLossOutput {
                total_loss,
                classification_loss,
                regression_loss,
                weighted_regression_loss,
                num_labeled,
                num_positives,
            })
        }
    }
}

mod rpn_loss_output {
    use super::*;

    #[derive(Debug)]
    pub struct RpnLossOutput {
        pub total_loss: Tensor,
        pub classification_loss: Tensor,
        /// Smooth L1 averaged over positive anchors.
        pub regression_loss: Tensor,
        /// Regression loss multiplied by the loss weight.
        pub weighted_regression_loss: Tensor,
        pub num_labeled: i64,
        pub num_positives: i64,
    }

    impl RpnLossOutput {
        pub fn is_finite(&self) -> bool {
            f64::from(&self.total_loss).is_finite()
        }
    }
}
