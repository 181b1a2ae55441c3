use super::{AnchorTargets, BatchTargets, LABEL_IGNORE, LABEL_NEGATIVE, LABEL_POSITIVE};
use crate::{anchor::AnchorSet, codec, common::*, dataset::GroundTruth, error::RpnError};

/// Thresholds and sampling budget of the target assigner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignerConfig {
    /// Anchors with max IoU at or above it are positive.
    #[serde(default = "default_pos_iou_threshold")]
    pub pos_iou_threshold: R64,
    /// Anchors with max IoU below it are negative. The gap between the two
    /// thresholds is ignored.
    #[serde(default = "default_neg_iou_threshold")]
    pub neg_iou_threshold: R64,
    /// Number of labeled anchors kept per image.
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    /// Maximum share of positives in the sample budget.
    #[serde(default = "default_pos_fraction")]
    pub pos_fraction: R64,
}

impl Default for AssignerConfig {
    fn default() -> Self {
        Self {
            pos_iou_threshold: default_pos_iou_threshold(),
            neg_iou_threshold: default_neg_iou_threshold(),
            num_samples: default_num_samples(),
            pos_fraction: default_pos_fraction(),
        }
    }
}

fn default_pos_iou_threshold() -> R64 {
    r64(0.7)
}

fn default_neg_iou_threshold() -> R64 {
    r64(0.3)
}

fn default_num_samples() -> usize {
    256
}

fn default_pos_fraction() -> R64 {
    r64(0.5)
}

/// Labels anchors against ground truth boxes and computes regression targets.
#[derive(Debug, Clone)]
pub struct TargetAssigner {
    pos_iou_threshold: f32,
    neg_iou_threshold: f32,
    num_samples: usize,
    max_positives: usize,
}

impl TargetAssigner {
    pub fn new(config: &AssignerConfig) -> Result<Self> {
        let AssignerConfig {
            pos_iou_threshold,
            neg_iou_threshold,
            num_samples,
            pos_fraction,
        } = *config;

        let check = |cond: bool, msg: &str| -> Result<()> {
            if cond {
                Ok(())
            } else {
                Err(RpnError::InvalidConfig(msg.into()).into())
            }
        };
        check(
            (0.0..=1.0).contains(&pos_iou_threshold.raw())
                && (0.0..=1.0).contains(&neg_iou_threshold.raw()),
            "IoU thresholds must be in range [0, 1]",
        )?;
        check(
            neg_iou_threshold <= pos_iou_threshold,
            "neg_iou_threshold must not exceed pos_iou_threshold",
        )?;
        check(num_samples > 0, "num_samples must be positive")?;
        check(
            (0.0..=1.0).contains(&pos_fraction.raw()),
            "pos_fraction must be in range [0, 1]",
        )?;

        Ok(Self {
            pos_iou_threshold: pos_iou_threshold.raw() as f32,
            neg_iou_threshold: neg_iou_threshold.raw() as f32,
            num_samples,
            max_positives: (pos_fraction.raw() * num_samples as f64) as usize,
        })
    }

    /// Computes targets for every image of a batch.
    ///
    /// Images are processed in order and each draws from `rng` independently,
    /// so a seeded generator yields reproducible samples.
    pub fn assign_batch<R>(
        &self,
        anchors: &AnchorSet,
        ground_truths: &[GroundTruth],
        rng: &mut R,
    ) -> Result<BatchTargets>
    where
        R: Rng + ?Sized,
    {
        let targets = ground_truths
            .iter()
            .map(|gt| self.assign(anchors, gt, &mut *rng))
            .collect::<Result<Vec<_>>>()?;
        BatchTargets::stack(&targets)
    }

    /// Computes targets for all anchors of one image.
    ///
    /// Anchors crossing the image border stay ignored regardless of overlap.
    /// An empty ground truth leaves every anchor ignored.
    pub fn assign<R>(
        &self,
        anchors: &AnchorSet,
        ground_truth: &GroundTruth,
        rng: &mut R,
    ) -> Result<AnchorTargets>
    where
        R: Rng + ?Sized,
    {
        let device = anchors.device();
        let num_anchors = anchors.len();
        let valid_indexes = anchors.valid_indexes();

        let mut labels = vec![LABEL_IGNORE; num_anchors as usize];
        let mut locs = Tensor::zeros(&[num_anchors, 4], (Kind::Float, device));

        if ground_truth.is_empty() || valid_indexes.is_empty() {
            return Ok(AnchorTargets {
                labels: Tensor::of_slice(&labels).to_device(device),
                locs,
            });
        }

        let valid_index_tensor = Tensor::of_slice(valid_indexes).to_device(device);
        let valid_anchors = anchors.boxes().index_select(&valid_index_tensor);
        let gt_boxes = ground_truth.to_tensor(device);

        // [num_valid, num_gt]
        let ious = valid_anchors.iou_matrix(&gt_boxes);
        let (max_ious, argmax_ious) = ious.max_dim(1, false);
        let (gt_max_ious, gt_argmax_ious) = ious.max_dim(0, false);

        // anchors sharing the best IoU of some ground truth box
        let mut rescued: Vec<bool> = {
            let is_best = ious.eq_tensor(&gt_max_ious.unsqueeze(0)).to_kind(Kind::Float);
            let has_overlap = gt_max_ious.gt(0.0).to_kind(Kind::Float).unsqueeze(0);
            let (rescued, _) = (is_best * has_overlap).max_dim(1, false);
            Vec::<f32>::from(&rescued)
                .into_iter()
                .map(|value| value > 0.0)
                .collect()
        };
        let mut matched_gt = Vec::<i64>::from(&argmax_ious);

        // a box overlapping no valid anchor still takes its argmax anchor,
        // which then regresses toward that box
        let gt_max_ious = Vec::<f32>::from(&gt_max_ious);
        let gt_argmax_ious = Vec::<i64>::from(&gt_argmax_ious);
        for (gt_index, (&best_iou, &anchor)) in
            gt_max_ious.iter().zip(&gt_argmax_ious).enumerate()
        {
            if best_iou <= 0.0 {
                rescued[anchor as usize] = true;
                matched_gt[anchor as usize] = gt_index as i64;
            }
        }
        let max_ious = Vec::<f32>::from(&max_ious);

        let mut valid_labels: Vec<i64> = max_ious
            .iter()
            .zip(&rescued)
            .map(|(&iou, &rescued)| {
                if rescued || iou >= self.pos_iou_threshold {
                    LABEL_POSITIVE
                } else if iou < self.neg_iou_threshold {
                    LABEL_NEGATIVE
                } else {
                    LABEL_IGNORE
                }
            })
            .collect();

        self.subsample(&mut valid_labels, rng);

        // regression targets of positives against their matched ground truth box
        let positives: Vec<i64> = valid_labels
            .iter()
            .enumerate()
            .filter(|(_, &label)| label == LABEL_POSITIVE)
            .map(|(index, _)| index as i64)
            .collect();

        if !positives.is_empty() {
            let positive_tensor = Tensor::of_slice(&positives).to_device(device);
            let positive_anchors = valid_anchors.index_select(&positive_tensor);
            let matched_indexes = Tensor::of_slice(&matched_gt)
                .to_device(device)
                .index_select(0, &positive_tensor);
            let matched_boxes = gt_boxes.index_select(&matched_indexes);
            let deltas = codec::encode(&positive_anchors, &matched_boxes)?;

            let full_indexes: Vec<i64> = positives
                .iter()
                .map(|&index| valid_indexes[index as usize])
                .collect();
            let full_index_tensor = Tensor::of_slice(&full_indexes).to_device(device);
            locs = locs.index_copy(0, &full_index_tensor, &deltas);
        }

        for (&anchor_index, &label) in valid_indexes.iter().zip(&valid_labels) {
            labels[anchor_index as usize] = label;
        }

        Ok(AnchorTargets {
            labels: Tensor::of_slice(&labels).to_device(device),
            locs,
        })
    }

    /// Caps positives first, then caps negatives to the remaining budget.
    /// Demoted anchors become ignored.
    fn subsample<R>(&self, labels: &mut [i64], rng: &mut R)
    where
        R: Rng + ?Sized,
    {
        let indexes_of = |labels: &[i64], target: i64| -> Vec<usize> {
            labels
                .iter()
                .enumerate()
                .filter(|(_, &label)| label == target)
                .map(|(index, _)| index)
                .collect()
        };

        let positives = indexes_of(labels, LABEL_POSITIVE);
        let negatives = indexes_of(labels, LABEL_NEGATIVE);

        if positives.len() > self.max_positives {
            let num_excess = positives.len() - self.max_positives;
            for &index in positives.choose_multiple(rng, num_excess) {
                labels[index] = LABEL_IGNORE;
            }
        }

        let num_positives = positives.len().min(self.max_positives);
        let max_negatives = self.num_samples.saturating_sub(num_positives);

        if negatives.len() > max_negatives {
            let num_excess = negatives.len() - max_negatives;
            for &index in negatives.choose_multiple(rng, num_excess) {
                labels[index] = LABEL_IGNORE;
            }
        }

        debug!(
            "sampled {} positives and {} negatives",
            num_positives,
            negatives.len().min(max_negatives)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{AnchorConfig, AnchorGenerator, GridLayout};
    use approx::assert_abs_diff_eq;

    fn anchors_600x800() -> Result<AnchorSet> {
        let generator = AnchorGenerator::new(&AnchorConfig::default())?;
        generator.generate(
            &GridLayout {
                feature_h: 37,
                feature_w: 50,
                image_h: 600,
                image_w: 800,
            },
            Device::Cpu,
        )
    }

    fn labels_of(targets: &AnchorTargets) -> Vec<i64> {
        Vec::<i64>::from(&targets.labels)
    }

    #[test]
    fn empty_ground_truth_ignores_everything() -> Result<()> {
        let anchors = anchors_600x800()?;
        let assigner = TargetAssigner::new(&AssignerConfig::default())?;
        let mut rng = StdRng::seed_from_u64(0);

        let targets = assigner.assign(&anchors, &GroundTruth::empty(0), &mut rng)?;
        assert_eq!(targets.num_anchors(), 16650);
        assert!(labels_of(&targets).iter().all(|&label| label == LABEL_IGNORE));
        assert_abs_diff_eq!(f64::from(targets.locs.abs().sum(Kind::Float)), 0.0);
        assert_eq!(targets.locs.size(), vec![16650, 4]);
        Ok(())
    }

    #[test]
    fn exact_anchor_match() -> Result<()> {
        let anchors = anchors_600x800()?;
        let assigner = TargetAssigner::new(&AssignerConfig::default())?;
        let mut rng = StdRng::seed_from_u64(1);

        // pick a valid anchor and use its exact box as ground truth
        let rects = anchors.boxes().to_rects();
        let anchor_index = anchors.valid_indexes()[anchors.valid_indexes().len() / 2];
        let anchor = rects[anchor_index as usize].clone();
        let gt = GroundTruth::new(0, [("car", anchor.tlbr())])?;

        let targets = assigner.assign(&anchors, &gt, &mut rng)?;
        let labels = labels_of(&targets);
        assert_eq!(labels[anchor_index as usize], LABEL_POSITIVE);

        // the target decodes back to the ground truth box
        let index = Tensor::of_slice(&[anchor_index]);
        let deltas = targets.locs.index_select(0, &index);
        let decoded = codec::decode(&anchors.boxes().index_select(&index), &deltas)?;
        let decoded = &decoded.to_rects()[0];
        for (lhs, rhs) in decoded.tlbr().iter().zip(anchor.tlbr()) {
            assert_abs_diff_eq!(*lhs, rhs, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn every_ground_truth_gets_a_positive() -> Result<()> {
        let anchors = anchors_600x800()?;
        // a budget large enough that no positive is dropped
        let assigner = TargetAssigner::new(&AssignerConfig {
            num_samples: 4096,
            ..Default::default()
        })?;
        let mut rng = StdRng::seed_from_u64(2);

        // small boxes that no anchor overlaps with IoU >= 0.7
        let gt = GroundTruth::new(
            0,
            [
                ("person", [100.0, 100.0, 130.0, 112.0]),
                ("sign", [400.0, 600.0, 410.0, 640.0]),
                ("car", [250.0, 300.0, 330.0, 420.0]),
            ],
        )?;
        let targets = assigner.assign(&anchors, &gt, &mut rng)?;
        let labels = labels_of(&targets);

        let ious = anchors.boxes().iou_matrix(&gt.to_tensor(Device::Cpu));
        let positive_mask = Tensor::of_slice(&labels)
            .eq(LABEL_POSITIVE)
            .to_kind(Kind::Float);
        for index in 0..gt.len() as i64 {
            let overlap = ious.i((.., index)).gt(0.0).to_kind(Kind::Float);
            let num_covered = f64::from((overlap * &positive_mask).sum(Kind::Float));
            assert!(num_covered > 0.0, "ground truth {} has no positive", index);
        }
        Ok(())
    }

    fn positive_indexes(targets: &AnchorTargets) -> Vec<i64> {
        labels_of(targets)
            .into_iter()
            .enumerate()
            .filter(|(_, label)| *label == LABEL_POSITIVE)
            .map(|(index, _)| index as i64)
            .collect()
    }

    fn assert_decodes_to(
        anchors: &AnchorSet,
        targets: &AnchorTargets,
        anchor_index: i64,
        expect: [f64; 4],
        epsilon: f64,
    ) -> Result<()> {
        let index = Tensor::of_slice(&[anchor_index]);
        let deltas = targets.locs.index_select(0, &index);
        let decoded = codec::decode(&anchors.boxes().index_select(&index), &deltas)?;
        let decoded = &decoded.to_rects()[0];
        for (lhs, rhs) in decoded.tlbr().iter().zip(expect) {
            assert_abs_diff_eq!(*lhs, rhs, epsilon = epsilon);
        }
        Ok(())
    }

    #[test]
    fn corner_box_takes_its_argmax_anchor() -> Result<()> {
        let anchors = anchors_600x800()?;
        let assigner = TargetAssigner::new(&AssignerConfig::default())?;
        let mut rng = StdRng::seed_from_u64(5);

        // no anchor inside the image reaches the top-left 5x5 corner
        let gt = GroundTruth::new(0, [("sign", [0.0, 0.0, 5.0, 5.0])])?;
        let valid_index_tensor = Tensor::of_slice(anchors.valid_indexes());
        let ious = anchors
            .boxes()
            .index_select(&valid_index_tensor)
            .iou_matrix(&gt.to_tensor(Device::Cpu));
        assert_abs_diff_eq!(f64::from(ious.max()), 0.0);

        let targets = assigner.assign(&anchors, &gt, &mut rng)?;
        let positives = positive_indexes(&targets);
        assert_eq!(positives.len(), 1);
        assert!(anchors.valid_indexes().contains(&positives[0]));
        assert_decodes_to(&anchors, &targets, positives[0], [0.0, 0.0, 5.0, 5.0], 1e-3)?;
        Ok(())
    }

    #[test]
    fn single_anchor_above_threshold() -> Result<()> {
        let generator = AnchorGenerator::new(&AnchorConfig {
            ratios: vec![r64(1.0)],
            scales: vec![r64(2.0), r64(4.0)],
        })?;
        let anchors = generator.generate(
            &GridLayout {
                feature_h: 37,
                feature_w: 50,
                image_h: 600,
                image_w: 800,
            },
            Device::Cpu,
        )?;
        let assigner = TargetAssigner::new(&AssignerConfig::default())?;
        let mut rng = StdRng::seed_from_u64(6);

        // a large anchor near the center; its neighbors reach IoU 0.6 and the
        // small anchor at the same position 0.25
        let large: Vec<i64> = anchors
            .valid_indexes()
            .iter()
            .copied()
            .filter(|index| index % 2 == 1)
            .collect();
        let anchor_index = large[large.len() / 2];
        let anchor = anchors.boxes().to_rects()[anchor_index as usize].clone();
        let gt = GroundTruth::new(0, [("car", anchor.tlbr())])?;

        let ious = anchors.boxes().iou_matrix(&gt.to_tensor(Device::Cpu));
        let num_above = f64::from(ious.ge(0.7).to_kind(Kind::Float).sum(Kind::Float));
        assert_abs_diff_eq!(num_above, 1.0);

        let targets = assigner.assign(&anchors, &gt, &mut rng)?;
        assert_eq!(positive_indexes(&targets), vec![anchor_index]);
        assert_decodes_to(&anchors, &targets, anchor_index, anchor.tlbr(), 1e-3)?;
        Ok(())
    }

    #[test]
    fn tied_anchors_are_all_rescued() -> Result<()> {
        // 20 pixel strides and 40x40 anchors centered at 10 + 20k
        let generator = AnchorGenerator::new(&AnchorConfig {
            ratios: vec![r64(1.0)],
            scales: vec![r64(2.0)],
        })?;
        let anchors = generator.generate(
            &GridLayout {
                feature_h: 30,
                feature_w: 40,
                image_h: 600,
                image_w: 800,
            },
            Device::Cpu,
        )?;
        let assigner = TargetAssigner::new(&AssignerConfig::default())?;
        let mut rng = StdRng::seed_from_u64(7);

        // four anchors each cover 30x30 of the box, IoU 900 / 2300
        let gt = GroundTruth::new(0, [("car", [80.0, 100.0, 120.0, 140.0])])?;
        let targets = assigner.assign(&anchors, &gt, &mut rng)?;
        assert_eq!(positive_indexes(&targets), vec![165, 166, 205, 206]);

        let ious = anchors.boxes().iou_matrix(&gt.to_tensor(Device::Cpu));
        for index in [165, 166, 205, 206] {
            assert_abs_diff_eq!(ious.double_value(&[index, 0]), 900.0 / 2300.0, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn sample_budget() -> Result<()> {
        let anchors = anchors_600x800()?;
        let config = AssignerConfig::default();
        let assigner = TargetAssigner::new(&config)?;
        let mut rng = StdRng::seed_from_u64(3);

        // large boxes produce many positives
        let gt = GroundTruth::new(
            0,
            [
                ("bus", [50.0, 50.0, 550.0, 400.0]),
                ("truck", [60.0, 420.0, 560.0, 780.0]),
                ("car", [200.0, 200.0, 500.0, 600.0]),
            ],
        )?;
        let targets = assigner.assign(&anchors, &gt, &mut rng)?;
        let num_pos = targets.num_positives() as usize;
        let num_neg = targets.num_negatives() as usize;

        assert!(num_pos > 0);
        assert!(num_pos <= 128);
        assert!(num_pos + num_neg <= config.num_samples);
        assert_eq!(num_pos + num_neg, config.num_samples);
        Ok(())
    }

    #[test]
    fn outside_anchors_are_ignored() -> Result<()> {
        let anchors = anchors_600x800()?;
        let assigner = TargetAssigner::new(&AssignerConfig::default())?;
        let mut rng = StdRng::seed_from_u64(4);

        // a box hugging the top-left corner overlaps many border-crossing anchors
        let gt = GroundTruth::new(0, [("car", [0.0, 0.0, 90.0, 90.0])])?;
        let targets = assigner.assign(&anchors, &gt, &mut rng)?;
        let labels = labels_of(&targets);

        let valid: std::collections::HashSet<i64> =
            anchors.valid_indexes().iter().copied().collect();
        let locs = targets.locs.abs().sum_dim_intlist(&[1], false, Kind::Float);
        let locs = Vec::<f32>::from(&locs);
        for (index, (&label, &loc)) in labels.iter().zip(&locs).enumerate() {
            if !valid.contains(&(index as i64)) {
                assert_eq!(label, LABEL_IGNORE);
                assert_eq!(loc, 0.0);
            }
        }
        Ok(())
    }

    #[test]
    fn seeded_assignment_is_reproducible() -> Result<()> {
        let anchors = anchors_600x800()?;
        let assigner = TargetAssigner::new(&AssignerConfig::default())?;
        let gts = vec![
            GroundTruth::new(0, [("bus", [50.0, 50.0, 550.0, 400.0])])?,
            GroundTruth::empty(1),
            GroundTruth::new(2, [("car", [200.0, 200.0, 500.0, 600.0])])?,
        ];

        let lhs = assigner.assign_batch(&anchors, &gts, &mut StdRng::seed_from_u64(42))?;
        let rhs = assigner.assign_batch(&anchors, &gts, &mut StdRng::seed_from_u64(42))?;
        assert_eq!(lhs.labels.size(), vec![3, 16650]);
        assert_eq!(lhs.locs.size(), vec![3, 16650, 4]);
        assert!(lhs.labels.equal(&rhs.labels));
        assert!(lhs.locs.equal(&rhs.locs));
        Ok(())
    }

    #[test]
    fn positive_cap_before_negative_cap() {
        let assigner = TargetAssigner::new(&AssignerConfig {
            num_samples: 10,
            pos_fraction: r64(0.5),
            ..Default::default()
        })
        .unwrap();
        let mut rng = StdRng::seed_from_u64(5);

        // 8 positives, 20 negatives: 5 positives survive, 5 negatives fill the rest
        let mut labels: Vec<i64> = iter_labels(8, 20);
        assigner.subsample(&mut labels, &mut rng);
        assert_eq!(labels.iter().filter(|&&l| l == LABEL_POSITIVE).count(), 5);
        assert_eq!(labels.iter().filter(|&&l| l == LABEL_NEGATIVE).count(), 5);

        // 2 positives leave room for 8 negatives
        let mut labels: Vec<i64> = iter_labels(2, 20);
        assigner.subsample(&mut labels, &mut rng);
        assert_eq!(labels.iter().filter(|&&l| l == LABEL_POSITIVE).count(), 2);
        assert_eq!(labels.iter().filter(|&&l| l == LABEL_NEGATIVE).count(), 8);
    }

    fn iter_labels(num_pos: usize, num_neg: usize) -> Vec<i64> {
        std::iter::repeat(LABEL_POSITIVE)
            .take(num_pos)
            .chain(std::iter::repeat(LABEL_NEGATIVE).take(num_neg))
            .chain(std::iter::repeat(LABEL_IGNORE).take(3))
            .collect()
    }

    #[test]
    fn reject_bad_config() {
        let err = TargetAssigner::new(&AssignerConfig {
            pos_iou_threshold: r64(0.3),
            neg_iou_threshold: r64(0.7),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RpnError>(),
            Some(RpnError::InvalidConfig(_))
        ));
    }
}
