use super::{Cbam, CbamInit};
use crate::{anchor::AnchorSet, common::*, error::RpnError};

/// Builder of the proposal head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpnHeadInit {
    #[serde(default = "default_in_channels")]
    pub in_channels: i64,
    #[serde(default = "default_mid_channels")]
    pub mid_channels: i64,
    /// Anchors per grid position. Must agree with the anchor generator.
    #[serde(default = "default_anchors_per_position")]
    pub anchors_per_position: i64,
    #[serde(default)]
    pub cbam: CbamInit,
}

impl Default for RpnHeadInit {
    fn default() -> Self {
        Self {
            in_channels: default_in_channels(),
            mid_channels: default_mid_channels(),
            anchors_per_position: default_anchors_per_position(),
            cbam: Default::default(),
        }
    }
}

fn default_in_channels() -> i64 {
    512
}

fn default_mid_channels() -> i64 {
    256
}

fn default_anchors_per_position() -> i64 {
    9
}

impl RpnHeadInit {
    pub fn build<'p, P>(self, path: P) -> Result<RpnHead>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            in_channels,
            mid_channels,
            anchors_per_position,
            cbam,
        } = self;

        if in_channels <= 0 || mid_channels <= 0 || anchors_per_position <= 0 {
            return Err(RpnError::InvalidConfig(format!(
                "channel and anchor counts must be positive, but get in_channels={}, mid_channels={}, anchors_per_position={}",
                in_channels, mid_channels, anchors_per_position
            ))
            .into());
        }

        let conv = |name: &str, in_c: i64, out_c: i64, k: i64| {
            nn::conv2d(
                path / name,
                in_c,
                out_c,
                k,
                nn::ConvConfig {
                    padding: k / 2,
                    ws_init: nn::Init::Randn {
                        mean: 0.0,
                        stdev: 0.01,
                    },
                    bs_init: nn::Init::Const(0.0),
                    ..Default::default()
                },
            )
        };

        let conv1 = conv("conv1", in_channels, mid_channels, 3);
        let conv2 = conv("conv2", mid_channels, mid_channels, 3);
        let conv3 = conv("conv3", mid_channels, mid_channels, 3);
        let cbam1 = cbam.clone().build(path / "cbam1", mid_channels)?;
        let cbam2 = cbam.build(path / "cbam2", mid_channels)?;
        let reg_layer = conv("reg_layer", mid_channels, anchors_per_position * 4, 1);
        let cls_layer = conv("cls_layer", mid_channels, anchors_per_position * 2, 1);

        // identity shortcut when channel counts agree
        let skip_conv = (in_channels != mid_channels).then(|| {
            nn::conv2d(
                path / "skip_conv",
                in_channels,
                mid_channels,
                1,
                Default::default(),
            )
        });

        Ok(RpnHead {
            anchors_per_position,
            conv1,
            conv2,
            conv3,
            cbam1,
            cbam2,
            skip_conv,
            reg_layer,
            cls_layer,
        })
    }
}

/// Attention-augmented region proposal head.
///
/// It maps a `[batch, in_channels, height, width]` feature map to per-anchor
/// predictions in the same order the anchor generator lays out anchors.
#[derive(Debug)]
pub struct RpnHead {
    anchors_per_position: i64,
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    conv3: nn::Conv2D,
    cbam1: Cbam,
    cbam2: Cbam,
    skip_conv: Option<nn::Conv2D>,
    reg_layer: nn::Conv2D,
    cls_layer: nn::Conv2D,
}

impl RpnHead {
    pub fn anchors_per_position(&self) -> i64 {
        self.anchors_per_position
    }

    pub fn forward_t(&self, features: &Tensor, train: bool) -> Result<RpnOutput> {
        let (batch_size, _channels, _height, _width) = features.size4()?;

        let residual = match &self.skip_conv {
            Some(skip_conv) => features.apply(skip_conv),
            None => features.shallow_clone(),
        };

        let xs = features.apply(&self.conv1).relu();
        let xs = self.cbam1.forward_t(&xs, train);
        let xs = xs.apply(&self.conv2).relu();
        let xs = self.cbam2.forward_t(&xs, train);
        let xs = (xs.apply(&self.conv3) + residual).relu();

        // [b, a * k, h, w] -> [b, h * w * a, k]
        let flatten = |xs: Tensor, k: i64| {
            xs.permute(&[0, 2, 3, 1])
                .contiguous()
                .view([batch_size, -1, k])
        };

        let deltas = flatten(xs.apply(&self.reg_layer), 4).tanh() * 2.0;
        let logits = flatten(xs.apply(&self.cls_layer), 2);
        let objectness = logits.softmax(-1, Kind::Float).i((.., .., 1));

        Ok(RpnOutput {
            deltas,
            logits,
            objectness,
        })
    }
}

/// Per-anchor predictions of a batch.
#[derive(Debug)]
pub struct RpnOutput {
    /// Regression deltas in shape `[batch, num_anchors, 4]`, bounded to (-2, 2).
    pub deltas: Tensor,
    /// Background and object logits in shape `[batch, num_anchors, 2]`.
    pub logits: Tensor,
    /// Object probability in shape `[batch, num_anchors]`.
    pub objectness: Tensor,
}

impl RpnOutput {
    pub fn batch_size(&self) -> i64 {
        self.deltas.size()[0]
    }

    pub fn num_anchors(&self) -> i64 {
        self.deltas.size()[1]
    }

    /// Fails with [RpnError::ShapeMismatch] if the prediction count differs
    /// from the anchor count.
    pub fn check_anchors(&self, anchors: &AnchorSet) -> Result<()> {
        anchors.check_count("network predictions", self.num_anchors())
    }
}
