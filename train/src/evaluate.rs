//! Proposal recall reports on held-out images.

use crate::{common::*, session::TrainingSession};

/// Mean and population standard deviation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeanStd {
    pub mean: f64,
    pub std: f64,
}

impl MeanStd {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let len = values.len() as f64;
        let mean = values.iter().sum::<f64>() / len;
        let var = values.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / len;
        Some(Self {
            mean,
            std: var.sqrt(),
        })
    }
}

impl std::fmt::Display for MeanStd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4} ± {:.4}", self.mean, self.std)
    }
}

/// Recall of each evaluated image and the summary over them.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    /// Dataset index and recall of images having ground truth.
    pub images: Vec<(usize, ImageRecall)>,
    /// Dataset indexes of images without ground truth.
    pub skipped: Vec<usize>,
    pub recall: Option<MeanStd>,
    pub error: Option<MeanStd>,
    pub mean_best_iou: Option<MeanStd>,
}

impl ValidationReport {
    pub fn new(images: Vec<(usize, ImageRecall)>, skipped: Vec<usize>) -> Self {
        let summarize = |f: fn(&ImageRecall) -> f64| {
            let values: Vec<_> = images.iter().map(|(_, image)| f(image)).collect();
            MeanStd::from_values(&values)
        };
        let recall = summarize(|image| image.recall);
        let error = summarize(|image| image.error());
        let mean_best_iou = summarize(|image| image.mean_best_iou);

        Self {
            images,
            skipped,
            recall,
            error,
            mean_best_iou,
        }
    }

    /// Writes the report to the log.
    pub fn log(&self, name: &str) {
        for (index, image) in &self.images {
            info!(
                "{} image {}: recall {:.4} ({}/{} boxes), avg IoU {:.4}, {} proposals",
                name,
                index,
                image.recall,
                image.num_matched,
                image.num_gt,
                image.mean_best_iou,
                image.num_proposals
            );
        }
        for index in &self.skipped {
            info!("{} image {}: no ground truth, skipped", name, index);
        }
        match (&self.recall, &self.error, &self.mean_best_iou) {
            (Some(recall), Some(error), Some(iou)) => info!(
                "{}: recall {}, error {}, avg IoU {}",
                name, recall, error, iou
            ),
            _ => warn!("{}: no image with ground truth to evaluate", name),
        }
    }
}

/// Evaluates the first `num_images` images of a batch.
pub fn validate(
    session: &mut TrainingSession,
    batch: Batch,
    num_images: usize,
) -> Result<ValidationReport> {
    let batch = batch.truncate(num_images);
    let Batch {
        images,
        ground_truths,
    } = batch;

    let (anchors, output) = tch::no_grad(|| session.forward_t(&images, false))?;
    let recall = session
        .recall()
        .batch_recall(&anchors, &output, &ground_truths)?;

    let (evaluated, skipped): (Vec<_>, Vec<_>) = ground_truths
        .iter()
        .zip(recall.images)
        .partition(|(_, image)| image.is_some());
    let evaluated = evaluated
        .into_iter()
        .filter_map(|(gt, image)| Some((gt.index, image?)))
        .collect();
    let skipped = skipped.into_iter().map(|(gt, _)| gt.index).collect();

    Ok(ValidationReport::new(evaluated, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn image(num_gt: usize, num_matched: usize, mean_best_iou: f64) -> ImageRecall {
        ImageRecall {
            num_gt,
            num_matched,
            num_proposals: 20,
            recall: num_matched as f64 / num_gt as f64,
            mean_best_iou,
        }
    }

    #[test]
    fn mean_and_population_std() {
        let stat = MeanStd::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_abs_diff_eq!(stat.mean, 5.0);
        assert_abs_diff_eq!(stat.std, 2.0);
        assert!(MeanStd::from_values(&[]).is_none());
    }

    #[test]
    fn report_statistics() {
        let report = ValidationReport::new(
            vec![(0, image(2, 2, 0.8)), (3, image(4, 1, 0.4))],
            vec![1],
        );

        let recall = report.recall.unwrap();
        assert_abs_diff_eq!(recall.mean, 0.625);
        assert_abs_diff_eq!(recall.std, 0.375);
        let error = report.error.unwrap();
        assert_abs_diff_eq!(error.mean, 0.375);
        assert_abs_diff_eq!(error.std, 0.375);
        let iou = report.mean_best_iou.unwrap();
        assert_abs_diff_eq!(iou.mean, 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(iou.std, 0.2, epsilon = 1e-12);
        assert_eq!(report.skipped, vec![1]);
    }

    #[test]
    fn empty_report() {
        let report = ValidationReport::new(vec![], vec![0, 1]);
        assert!(report.recall.is_none());
        assert!(report.error.is_none());
        assert!(report.mean_best_iou.is_none());
        report.log("empty");
    }

    #[test]
    fn validate_first_images() -> Result<()> {
        let mut session = crate::session::TrainingSessionInit {
            anchors: AnchorConfig {
                ratios: vec![r64(1.0)],
                scales: vec![r64(2.0)],
            },
            assigner: Default::default(),
            head: RpnHeadInit {
                mid_channels: 8,
                anchors_per_position: 1,
                ..Default::default()
            },
            loss: Default::default(),
            recall: RecallInit {
                top_k: 24,
                iou_threshold: r64(0.5),
            },
            backbone_weights: None,
            lr: 1e-3,
            weight_decay: 0.0,
            seed: 1,
            device: Device::Cpu,
        }
        .build()?;

        let batch = Batch {
            images: Tensor::rand(&[3, 3, 64, 96], FLOAT_CPU),
            ground_truths: vec![
                GroundTruth::new(4, [("car", [8.0, 24.0, 40.0, 56.0])])?,
                GroundTruth::empty(9),
                GroundTruth::new(2, [("bus", [0.0, 0.0, 8.0, 8.0])])?,
            ],
        };
        let report = validate(&mut session, batch, 2)?;

        // the third image is cut off and every anchor becomes a proposal
        assert_eq!(report.images.len(), 1);
        let (index, image) = &report.images[0];
        assert_eq!(*index, 4);
        assert_eq!(image.num_proposals, 24);
        assert_eq!(report.skipped, vec![9]);
        assert_eq!(report.recall.map(|stat| stat.std), Some(0.0));
        Ok(())
    }
}
