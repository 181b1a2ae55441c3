//! The training session owning the model, the optimizer and the counters.

use crate::{
    common::*,
    config::{Config, LoadCheckpoint},
    utils,
};

/// Builder of a [TrainingSession].
#[derive(Debug, Clone)]
pub struct TrainingSessionInit {
    pub anchors: AnchorConfig,
    pub assigner: AssignerConfig,
    pub head: RpnHeadInit,
    pub loss: RpnLossInit,
    pub recall: RecallInit,
    /// Pretrained backbone weights. The backbone is randomly initialized if unset.
    pub backbone_weights: Option<PathBuf>,
    pub lr: f64,
    pub weight_decay: f64,
    pub seed: u64,
    pub device: Device,
}

impl TrainingSessionInit {
    pub fn from_config(config: &Config) -> Self {
        let Config {
            model,
            anchors,
            assigner,
            training,
            evaluation,
            ..
        } = config;

        Self {
            anchors: anchors.clone(),
            assigner: assigner.clone(),
            head: model.head.clone(),
            loss: training.loss.clone(),
            recall: evaluation.recall.clone(),
            backbone_weights: model.backbone_weights.clone(),
            lr: training.lr.raw(),
            weight_decay: training.weight_decay.raw(),
            seed: training.seed,
            device: training.device,
        }
    }

    pub fn build(self) -> Result<TrainingSession> {
        let Self {
            anchors,
            assigner,
            head,
            loss,
            recall,
            backbone_weights,
            lr,
            weight_decay,
            seed,
            device,
        } = self;

        ensure!(lr > 0.0, "learning rate must be positive, but get {}", lr);
        tch::manual_seed(seed as i64);

        let anchor_generator = AnchorGenerator::new(&anchors)?;
        if anchor_generator.num_per_position() != head.anchors_per_position {
            return Err(RpnError::shape_mismatch(
                "anchors per position",
                head.anchors_per_position,
                anchor_generator.num_per_position(),
            )
            .into());
        }

        let backbone = match &backbone_weights {
            Some(path) => Vgg16Backbone::load(device, path)?,
            None => {
                warn!("no backbone weights given, the backbone is randomly initialized");
                Vgg16Backbone::new(device)
            }
        };

        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let head = head.build(&root / "rpn")?;
        let epoch_tensor = root.zeros_no_train("epoch", &[]);
        let optimizer = nn::Adam {
            wd: weight_decay,
            ..Default::default()
        }
        .build(&vs, lr)?;

        Ok(TrainingSession {
            vs,
            optimizer,
            backbone,
            head,
            anchor_generator,
            anchor_cache: HashMap::new(),
            assigner: TargetAssigner::new(&assigner)?,
            loss: loss.build()?,
            recall: recall.build()?,
            rng: StdRng::seed_from_u64(seed),
            lr,
            device,
            epoch: 0,
            step: 0,
            epoch_tensor,
        })
    }
}

/// Model parameters, optimizer state and counters of one training run.
pub struct TrainingSession {
    vs: nn::VarStore,
    optimizer: nn::Optimizer,
    backbone: Vgg16Backbone,
    head: RpnHead,
    anchor_generator: AnchorGenerator,
    anchor_cache: HashMap<GridLayout, Arc<AnchorSet>>,
    assigner: TargetAssigner,
    loss: RpnLoss,
    recall: ProposalRecall,
    rng: StdRng,
    lr: f64,
    device: Device,
    epoch: usize,
    step: usize,
    /// Mirrors `epoch` so that checkpoints remember it.
    epoch_tensor: Tensor,
}

impl Debug for TrainingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingSession")
            .field("device", &self.device)
            .field("lr", &self.lr)
            .field("epoch", &self.epoch)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

/// Losses and recall of one optimization step.
#[derive(Debug)]
pub struct StepOutput {
    pub step: usize,
    pub batch_size: usize,
    pub total_loss: f64,
    pub classification_loss: f64,
    pub weighted_regression_loss: f64,
    pub num_labeled: i64,
    pub num_positives: i64,
    pub recall: BatchRecall,
    /// False if the loss was not finite and the update was skipped.
    pub updated: bool,
}

/// Per sample averages over one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub num_samples: usize,
    pub num_batches: usize,
    pub num_skipped_batches: usize,
    pub mean_loss: f64,
    pub mean_classification_loss: f64,
    pub mean_regression_loss: f64,
    /// Mean of the per batch mean recalls, over batches with ground truth.
    pub mean_recall: Option<f64>,
}

impl EpochSummary {
    pub fn error(&self) -> Option<f64> {
        self.mean_recall.map(|recall| 1.0 - recall)
    }
}

impl TrainingSession {
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// The number of finished epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// The number of finished optimization steps.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn recall(&self) -> &ProposalRecall {
        &self.recall
    }

    /// Returns the anchors of a feature map, generating them on first use.
    pub fn anchors(&mut self, layout: GridLayout) -> Result<Arc<AnchorSet>> {
        if let Some(anchors) = self.anchor_cache.get(&layout) {
            return Ok(anchors.clone());
        }
        let anchors = Arc::new(self.anchor_generator.generate(&layout, self.device)?);
        debug!("generated {} anchors for {:?}", anchors.len(), layout);
        self.anchor_cache.insert(layout, anchors.clone());
        Ok(anchors)
    }

    /// Runs the backbone and the head on `[batch, 3, height, width]` images.
    pub fn forward_t(&mut self, images: &Tensor, train: bool) -> Result<(Arc<AnchorSet>, RpnOutput)> {
        let (_b, _c, image_h, image_w) = images.size4()?;
        let images = images.to_device(self.device);
        let features = self.backbone.forward(&images);
        let anchors = self.anchors(GridLayout::from_features(&features, image_h, image_w)?)?;
        let output = self.head.forward_t(&features, train)?;
        output.check_anchors(&anchors)?;
        Ok((anchors, output))
    }

    /// Runs one optimization step on a batch.
    ///
    /// A non-finite loss is reported but the update is skipped.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepOutput> {
        let (anchors, output) = self.forward_t(&batch.images, true)?;
        let targets = self
            .assigner
            .assign_batch(&anchors, &batch.ground_truths, &mut self.rng)?;
        let losses = self.loss.forward(&output, &targets)?;

        let updated = losses.is_finite();
        if updated {
            self.optimizer.backward_step(&losses.total_loss);
        } else {
            warn!(
                "non-finite loss {} at step {}, skip the update",
                f64::from(&losses.total_loss),
                self.step
            );
        }

        let recall = self
            .recall
            .batch_recall(&anchors, &output, &batch.ground_truths)?;
        let step = self.step;
        self.step += 1;

        Ok(StepOutput {
            step,
            batch_size: batch.batch_size(),
            total_loss: f64::from(&losses.total_loss),
            classification_loss: f64::from(&losses.classification_loss),
            weighted_regression_loss: f64::from(&losses.weighted_regression_loss),
            num_labeled: losses.num_labeled,
            num_positives: losses.num_positives,
            recall,
            updated,
        })
    }

    /// Trains one pass over `dataset` in shuffled batches.
    ///
    /// `on_step` is called after every step.
    pub fn train_epoch<D, F>(
        &mut self,
        dataset: &D,
        batch_size: usize,
        mut on_step: F,
    ) -> Result<EpochSummary>
    where
        D: RandomAccessDataset + ?Sized,
        F: FnMut(&StepOutput) -> Result<()>,
    {
        ensure!(dataset.num_records() > 0, "cannot train on an empty dataset");
        let batches = batch_indexes(dataset.num_records(), batch_size, Some(&mut self.rng));

        let mut num_samples = 0;
        let mut num_skipped_batches = 0;
        let mut loss_sum = 0.0;
        let mut classification_sum = 0.0;
        let mut regression_sum = 0.0;
        let mut batch_recalls = Vec::with_capacity(batches.len());

        for indexes in &batches {
            let batch = load_batch(dataset, indexes)?;
            let output = self.train_step(&batch)?;
            on_step(&output)?;

            let size = output.batch_size as f64;
            num_samples += output.batch_size;
            loss_sum += output.total_loss * size;
            classification_sum += output.classification_loss * size;
            regression_sum += output.weighted_regression_loss * size;
            if !output.updated {
                num_skipped_batches += 1;
            }
            batch_recalls.push(output.recall);
        }

        self.epoch += 1;
        self.epoch_tensor
            .copy_(&Tensor::from(self.epoch as f32).to_device(self.device));

        let denom = num_samples as f64;
        Ok(EpochSummary {
            epoch: self.epoch,
            num_samples,
            num_batches: batches.len(),
            num_skipped_batches,
            mean_loss: loss_sum / denom,
            mean_classification_loss: classification_sum / denom,
            mean_regression_loss: regression_sum / denom,
            mean_recall: mean_batch_recall(&batch_recalls),
        })
    }

    pub fn save_checkpoint(&self, checkpoint_dir: &Path, loss: f64) -> Result<PathBuf> {
        utils::save_checkpoint(&self.vs, checkpoint_dir, self.epoch, loss)
    }

    /// Restores parameters and the epoch counter from a checkpoint.
    pub fn load_checkpoint(
        &mut self,
        logging_dir: &Path,
        load_checkpoint: &LoadCheckpoint,
    ) -> Result<Option<PathBuf>> {
        let path = utils::try_load_checkpoint(&mut self.vs, logging_dir, load_checkpoint)?;
        if path.is_some() {
            self.epoch = f64::from(&self.epoch_tensor) as usize;
            info!("resume from epoch {}", self.epoch);
        }
        Ok(path)
    }
}

/// Averages the mean recall of each batch, skipping batches without ground truth.
fn mean_batch_recall(recalls: &[BatchRecall]) -> Option<f64> {
    let means: Vec<f64> = recalls.iter().filter_map(BatchRecall::mean_recall).collect();
    (!means.is_empty()).then(|| means.iter().sum::<f64>() / means.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbam_rpn::dataset::DataRecord;

    /// Images with one square box that some anchor matches exactly.
    #[derive(Debug)]
    struct SquareDataset {
        num: usize,
    }

    impl RandomAccessDataset for SquareDataset {
        fn num_records(&self) -> usize {
            self.num
        }

        fn nth(&self, index: usize) -> Result<DataRecord> {
            let image = Tensor::rand(&[3, 64, 96], FLOAT_CPU);
            let ground_truth = if index % 3 == 2 {
                GroundTruth::empty(index)
            } else {
                GroundTruth::new(index, [("car", [8.0, 24.0, 40.0, 56.0])])?
            };
            Ok(DataRecord {
                image,
                ground_truth,
            })
        }
    }

    fn session_init(seed: u64) -> TrainingSessionInit {
        TrainingSessionInit {
            anchors: AnchorConfig {
                ratios: vec![r64(1.0)],
                scales: vec![r64(1.0), r64(2.0)],
            },
            assigner: AssignerConfig {
                num_samples: 16,
                ..Default::default()
            },
            head: RpnHeadInit {
                mid_channels: 8,
                anchors_per_position: 2,
                ..Default::default()
            },
            loss: Default::default(),
            recall: RecallInit {
                top_k: 5,
                ..Default::default()
            },
            backbone_weights: None,
            lr: 1e-3,
            weight_decay: 1e-4,
            seed,
            device: Device::Cpu,
        }
    }

    #[test]
    fn reject_mismatched_anchor_count() {
        let mut init = session_init(0);
        init.head.anchors_per_position = 9;
        let err = init.build().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RpnError>(),
            Some(RpnError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn train_step_updates_head() -> Result<()> {
        let mut session = session_init(7).build()?;
        let dataset = SquareDataset { num: 2 };
        let batch = load_batch(&dataset, &[0, 1])?;

        let before: Vec<f32> = Vec::from(&session.var_store().variables()["rpn.cls_layer.weight"]);
        let output = session.train_step(&batch)?;
        let after: Vec<f32> = Vec::from(&session.var_store().variables()["rpn.cls_layer.weight"]);

        assert!(output.updated);
        assert!(output.total_loss.is_finite());
        assert!(output.num_positives >= 2);
        assert!(output.num_labeled <= 2 * 16);
        assert_eq!(output.recall.images.len(), 2);
        assert_eq!(output.step, 0);
        assert_eq!(session.step(), 1);
        assert_ne!(before, after);

        // anchors are generated once per feature map size
        assert_eq!(session.anchor_cache.len(), 1);
        Ok(())
    }

    #[test]
    fn non_finite_loss_skips_update() -> Result<()> {
        let mut session = session_init(5).build()?;
        let dataset = SquareDataset { num: 2 };
        let Batch { ground_truths, .. } = load_batch(&dataset, &[0, 1])?;
        let batch = Batch {
            images: Tensor::full(&[2, 3, 64, 96], f64::NAN, FLOAT_CPU),
            ground_truths,
        };

        let before: Vec<f32> = Vec::from(&session.var_store().variables()["rpn.cls_layer.weight"]);
        let output = session.train_step(&batch)?;
        let after: Vec<f32> = Vec::from(&session.var_store().variables()["rpn.cls_layer.weight"]);

        assert!(!output.updated);
        assert!(output.total_loss.is_nan());
        assert_eq!(before, after);
        assert_eq!(session.step(), 1);
        Ok(())
    }

    #[test]
    fn epoch_summary() -> Result<()> {
        let mut session = session_init(3).build()?;
        let dataset = SquareDataset { num: 5 };

        let mut steps = vec![];
        let summary = session.train_epoch(&dataset, 2, |output| {
            steps.push(output.batch_size);
            Ok(())
        })?;

        assert_eq!(steps, vec![2, 2, 1]);
        assert_eq!(summary.epoch, 1);
        assert_eq!(summary.num_samples, 5);
        assert_eq!(summary.num_batches, 3);
        assert!(summary.mean_loss.is_finite());
        let recall = summary.mean_recall.unwrap();
        assert!((0.0..=1.0).contains(&recall));
        assert_eq!(session.epoch(), 1);
        assert_eq!(f64::from(&session.epoch_tensor), 1.0);
        Ok(())
    }

    #[test]
    fn epoch_recall_averages_batches() {
        let image = |num_matched| {
            Some(ImageRecall {
                num_gt: 1,
                num_matched,
                num_proposals: 5,
                recall: num_matched as f64,
                mean_best_iou: 0.5,
            })
        };
        let recalls = vec![
            BatchRecall {
                images: vec![image(1), image(1)],
            },
            BatchRecall {
                images: vec![image(0)],
            },
            BatchRecall {
                images: vec![None, None],
            },
        ];

        assert_eq!(mean_batch_recall(&recalls), Some(0.5));
        assert_eq!(mean_batch_recall(&recalls[2..]), None);
        assert_eq!(mean_batch_recall(&[]), None);
    }

    #[test]
    fn checkpoint_restores_epoch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let checkpoint_dir = dir.path().join("run/checkpoints");
        fs::create_dir_all(&checkpoint_dir)?;

        let mut session = session_init(5).build()?;
        session.train_epoch(&SquareDataset { num: 2 }, 2, |_| Ok(()))?;
        let saved = session.save_checkpoint(&checkpoint_dir, 1.5)?;

        let mut resumed = session_init(5).build()?;
        let loaded = resumed.load_checkpoint(dir.path(), &LoadCheckpoint::FromRecent)?;
        assert_eq!(loaded, Some(saved));
        assert_eq!(resumed.epoch(), 1);

        let key = "rpn.reg_layer.weight";
        assert!(session.var_store().variables()[key].equal(&resumed.var_store().variables()[key]));
        Ok(())
    }
}
