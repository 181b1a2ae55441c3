//! Training program configuration format.

use crate::common::*;

pub use dataset::*;
pub use evaluation::*;
pub use model::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub anchors: AnchorConfig,
    #[serde(default)]
    pub assigner: AssignerConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }
}

mod dataset {
    use super::*;

    /// Dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// The directory of .jpg, .jpeg and .png images.
        pub image_dir: PathBuf,
        /// The BDD100K-style JSON label file.
        pub label_file: PathBuf,
        /// Only the first items of the label file are used if set.
        #[serde(default)]
        pub max_labels: Option<usize>,
        /// The diretory to save the image cache.
        pub cache_dir: PathBuf,
        /// Images are resized to this height.
        #[serde(default = "default_image_h")]
        pub image_h: NonZeroUsize,
        /// Images are resized to this width.
        #[serde(default = "default_image_w")]
        pub image_w: NonZeroUsize,
        #[serde(default)]
        pub split: SplitConfig,
        /// If set, train on the first records of the training split only.
        #[serde(default)]
        pub train_subset: Option<NonZeroUsize>,
    }

    fn default_image_h() -> NonZeroUsize {
        NonZeroUsize::new(600).unwrap()
    }

    fn default_image_w() -> NonZeroUsize {
        NonZeroUsize::new(800).unwrap()
    }
}

mod model {
    use super::*;

    /// The model configuration.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct ModelConfig {
        /// Pretrained VGG16 feature weights with torchvision variable names.
        #[serde(default)]
        pub backbone_weights: Option<PathBuf>,
        #[serde(default)]
        pub head: RpnHeadInit,
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        #[serde(default = "default_batch_size")]
        pub batch_size: NonZeroUsize,
        #[serde(default = "default_epochs")]
        pub epochs: usize,
        #[serde(default = "default_lr")]
        pub lr: R64,
        /// The weight decay parameter for optimizer.
        #[serde(default = "default_weight_decay")]
        pub weight_decay: R64,
        /// Seeds libtorch and the generator driving splitting, shuffling and
        /// anchor sampling.
        #[serde(default = "default_seed")]
        pub seed: u64,
        #[serde(default)]
        pub loss: RpnLossInit,
        /// If set, it saves a checkpoint file per this epochs.
        #[serde(default = "default_save_checkpoint_epochs")]
        pub save_checkpoint_epochs: Option<NonZeroUsize>,
        /// Checkpoint file loading method.
        #[serde(default)]
        pub load_checkpoint: LoadCheckpoint,
        #[serde(with = "tch_serde::serde_device", default = "default_device")]
        pub device: Device,
    }

    impl Default for TrainingConfig {
        fn default() -> Self {
            Self {
                batch_size: default_batch_size(),
                epochs: default_epochs(),
                lr: default_lr(),
                weight_decay: default_weight_decay(),
                seed: default_seed(),
                loss: Default::default(),
                save_checkpoint_epochs: default_save_checkpoint_epochs(),
                load_checkpoint: Default::default(),
                device: default_device(),
            }
        }
    }

    fn default_batch_size() -> NonZeroUsize {
        NonZeroUsize::new(8).unwrap()
    }

    fn default_epochs() -> usize {
        20
    }

    fn default_lr() -> R64 {
        r64(1e-3)
    }

    fn default_weight_decay() -> R64 {
        r64(1e-4)
    }

    fn default_seed() -> u64 {
        42
    }

    fn default_save_checkpoint_epochs() -> Option<NonZeroUsize> {
        NonZeroUsize::new(5)
    }

    fn default_device() -> Device {
        Device::cuda_if_available()
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the most recent checkpoint file.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile { file: PathBuf },
    }

    impl Default for LoadCheckpoint {
        fn default() -> Self {
            Self::Disabled
        }
    }
}

mod evaluation {
    use super::*;

    /// Proposal evaluation options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EvaluationConfig {
        #[serde(flatten)]
        pub recall: RecallInit,
        /// The number of images in a validation report.
        #[serde(default = "default_num_images")]
        pub num_images: usize,
    }

    impl Default for EvaluationConfig {
        fn default() -> Self {
            Self {
                recall: Default::default(),
                num_images: default_num_images(),
            }
        }
    }

    fn default_num_images() -> usize {
        7
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config() -> Result<()> {
        let config: Config = json5::from_str(
            r#"{
                dataset: {
                    image_dir: "images",
                    label_file: "labels.json",
                    cache_dir: "cache",
                },
                logging: { dir: "logs" },
            }"#,
        )?;

        assert_eq!(config.dataset.image_h.get(), 600);
        assert_eq!(config.dataset.image_w.get(), 800);
        assert_eq!(config.dataset.split, SplitConfig::default());
        assert_eq!(config.anchors, AnchorConfig::default());
        assert_eq!(config.assigner, AssignerConfig::default());
        assert_eq!(config.training.batch_size.get(), 8);
        assert_eq!(config.training.save_checkpoint_epochs.map(|n| n.get()), Some(5));
        assert!(matches!(config.training.load_checkpoint, LoadCheckpoint::Disabled));
        assert_eq!(config.evaluation.recall.top_k, 20);
        assert_eq!(config.evaluation.num_images, 7);
        assert_eq!(config.model.head.mid_channels, 256);
        Ok(())
    }

    #[test]
    fn example_config_parses() -> Result<()> {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("train.json5");
        let config = Config::open(path)?;

        assert_eq!(config.training.device, Device::Cpu);
        assert_eq!(config.training.epochs, 30);
        assert_eq!(config.dataset.train_subset.map(|n| n.get()), Some(100));
        assert!(matches!(config.training.load_checkpoint, LoadCheckpoint::FromRecent));
        Ok(())
    }
}
