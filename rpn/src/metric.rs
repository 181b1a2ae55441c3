//! Proposal recall, the primary quality signal of the proposal network.

use crate::{
    anchor::AnchorSet, codec, common::*, dataset::GroundTruth, error::RpnError, model::RpnOutput,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallInit {
    /// Number of highest-scoring proposals kept per image.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// A ground truth box counts as recalled if a kept proposal reaches this IoU.
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: R64,
}

impl Default for RecallInit {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            iou_threshold: default_iou_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    20
}

fn default_iou_threshold() -> R64 {
    r64(0.5)
}

impl RecallInit {
    pub fn build(self) -> Result<ProposalRecall> {
        let Self {
            top_k,
            iou_threshold,
        } = self;
        if top_k == 0 {
            return Err(RpnError::InvalidConfig("top_k must be positive".into()).into());
        }
        if !(0.0..=1.0).contains(&iou_threshold.raw()) {
            return Err(RpnError::InvalidConfig(format!(
                "iou_threshold must be in range [0, 1], but get {}",
                iou_threshold
            ))
            .into());
        }
        Ok(ProposalRecall {
            top_k: top_k as i64,
            iou_threshold: iou_threshold.raw(),
        })
    }
}

/// Recall statistics of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecall {
    pub num_gt: usize,
    pub num_matched: usize,
    pub num_proposals: usize,
    /// Fraction of ground truth boxes matched by some proposal.
    pub recall: f64,
    /// Best proposal IoU averaged over ground truth boxes.
    pub mean_best_iou: f64,
}

impl ImageRecall {
    pub fn error(&self) -> f64 {
        1.0 - self.recall
    }
}

/// Recall statistics of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecall {
    /// Per image statistics in batch order. Images without ground truth are `None`.
    pub images: Vec<Option<ImageRecall>>,
}

impl BatchRecall {
    /// Mean recall over images having ground truth, if any.
    pub fn mean_recall(&self) -> Option<f64> {
        let recalls: Vec<_> = self.images.iter().flatten().map(|image| image.recall).collect();
        (!recalls.is_empty()).then(|| recalls.iter().sum::<f64>() / recalls.len() as f64)
    }
}

/// Ranks decoded proposals by objectness and measures how many ground truth
/// boxes they cover.
#[derive(Debug, Clone)]
pub struct ProposalRecall {
    top_k: i64,
    iou_threshold: f64,
}

impl ProposalRecall {
    pub fn top_k(&self) -> i64 {
        self.top_k
    }

    pub fn iou_threshold(&self) -> f64 {
        self.iou_threshold
    }

    /// Decodes the `[num_anchors, 4]` deltas of one image and keeps the
    /// proposals with the highest `[num_anchors]` objectness, best first.
    pub fn proposals(
        &self,
        anchors: &AnchorSet,
        deltas: &Tensor,
        objectness: &Tensor,
    ) -> Result<TLBRTensor> {
        anchors.check_count("objectness scores", objectness.size1()?)?;
        let decoded = codec::decode(anchors.boxes(), deltas)?;

        let k = self.top_k.min(anchors.len());
        let (_scores, indexes) = objectness.to_device(anchors.device()).topk(k, 0, true, true);
        Ok(decoded.index_select(&indexes))
    }

    /// Computes the recall of `proposals` over the ground truth of one image.
    ///
    /// Returns `None` when the image has no ground truth box.
    pub fn image_recall(
        &self,
        proposals: &TLBRTensor,
        ground_truth: &GroundTruth,
    ) -> Option<ImageRecall> {
        if ground_truth.is_empty() {
            return None;
        }

        let num_gt = ground_truth.len();
        let num_proposals = proposals.num_samples() as usize;
        let best_ious: Vec<f32> = if num_proposals > 0 {
            let gt_boxes = ground_truth.to_tensor(proposals.device());
            let (best, _) = gt_boxes.iou_matrix(proposals).max_dim(1, false);
            Vec::<f32>::from(&best)
        } else {
            vec![0.0; num_gt]
        };

        let num_matched = best_ious
            .iter()
            .filter(|&&iou| iou as f64 >= self.iou_threshold)
            .count();
        let mean_best_iou = best_ious.iter().map(|&iou| iou as f64).sum::<f64>() / num_gt as f64;

        Some(ImageRecall {
            num_gt,
            num_matched,
            num_proposals,
            recall: num_matched as f64 / num_gt as f64,
            mean_best_iou,
        })
    }

    /// Computes per image recall of a batch of network outputs.
    pub fn batch_recall(
        &self,
        anchors: &AnchorSet,
        output: &RpnOutput,
        ground_truths: &[GroundTruth],
    ) -> Result<BatchRecall> {
        output.check_anchors(anchors)?;
        let batch_size = output.batch_size();
        if batch_size != ground_truths.len() as i64 {
            return Err(RpnError::shape_mismatch(
                "recall batch size",
                batch_size,
                ground_truths.len() as i64,
            )
            .into());
        }

        let images = tch::no_grad(|| -> Result<_> {
            ground_truths
                .iter()
                .enumerate()
                .map(|(index, ground_truth)| -> Result<_> {
                    let index = index as i64;
                    let proposals = self.proposals(
                        anchors,
                        &output.deltas.i(index),
                        &output.objectness.i(index),
                    )?;
                    Ok(self.image_recall(&proposals, ground_truth))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        Ok(BatchRecall { images })
    }
}
