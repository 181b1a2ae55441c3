use crate::common::*;

/// Output channels of the VGG16 convolutions up to `conv5_3`. `None` marks a
/// 2x2 max pooling.
const VGG16_LAYOUT: [Option<i64>; 17] = [
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
    None,
    Some(512),
    Some(512),
    Some(512),
];

/// Channels of the backbone output.
pub const BACKBONE_CHANNELS: i64 = 512;
/// Downsampling factor of the backbone.
pub const BACKBONE_STRIDE: i64 = 16;

#[derive(Debug)]
enum Layer {
    Conv(nn::Conv2D),
    MaxPool,
}

/// The convolutional part of VGG16, truncated after `relu5_3`.
///
/// The variables live in a store of their own that is frozen after
/// construction. They are named `features.N.weight` and `features.N.bias`
/// with `N` the index in the torchvision layer sequence, so a converted
/// pretrained checkpoint loads as is.
#[derive(Debug)]
pub struct Vgg16Backbone {
    vs: nn::VarStore,
    layers: Vec<Layer>,
}

impl Vgg16Backbone {
    pub fn new(device: Device) -> Self {
        let mut vs = nn::VarStore::new(device);
        let root = vs.root();
        let features = &root / "features";

        let mut in_c = 3;
        let mut index = 0;
        let layers: Vec<_> = VGG16_LAYOUT
            .iter()
            .map(|&layer| match layer {
                Some(out_c) => {
                    let conv = nn::conv2d(
                        &features / index,
                        in_c,
                        out_c,
                        3,
                        nn::ConvConfig {
                            padding: 1,
                            ..Default::default()
                        },
                    );
                    in_c = out_c;
                    // the ReLU takes the next index
                    index += 2;
                    Layer::Conv(conv)
                }
                None => {
                    index += 1;
                    Layer::MaxPool
                }
            })
            .collect();
        debug_assert_eq!(index, 30);

        vs.freeze();
        Self { vs, layers }
    }

    /// Builds the backbone and loads pretrained weights from `path`.
    ///
    /// Variables missing in the file keep their random initialization and
    /// are reported with a warning.
    pub fn load<P>(device: Device, path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let mut backbone = Self::new(device);
        let missing = backbone
            .vs
            .load_partial(path)
            .with_context(|| format!("failed to load backbone weights from '{}'", path.display()))?;
        if !missing.is_empty() {
            warn!(
                "{} backbone variables are missing in '{}': {}",
                missing.len(),
                path.display(),
                missing.join(", ")
            );
        }
        backbone.vs.freeze();
        Ok(backbone)
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Extracts `[batch, 512, height / 16, width / 16]` features from
    /// `[batch, 3, height, width]` images. No gradient is recorded.
    pub fn forward(&self, images: &Tensor) -> Tensor {
        tch::no_grad(|| {
            self.layers
                .iter()
                .fold(images.to_device(self.device()), |xs, layer| match layer {
                    Layer::Conv(conv) => xs.apply(conv).relu(),
                    Layer::MaxPool => xs.max_pool2d(&[2, 2], &[2, 2], &[0, 0], &[1, 1], false),
                })
        })
    }
}
