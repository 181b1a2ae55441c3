use crate::{common::*, error::RpnError};

/// Builder of a [Cbam] attention block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CbamInit {
    /// Channel reduction factor of the shared MLP.
    #[serde(default = "default_reduction")]
    pub reduction: i64,
    /// Kernel size of the spatial attention convolution. Must be odd.
    #[serde(default = "default_kernel_size")]
    pub kernel_size: i64,
}

impl Default for CbamInit {
    fn default() -> Self {
        Self {
            reduction: default_reduction(),
            kernel_size: default_kernel_size(),
        }
    }
}

fn default_reduction() -> i64 {
    4
}

fn default_kernel_size() -> i64 {
    3
}

impl CbamInit {
    pub fn build<'p, P>(self, path: P, channels: i64) -> Result<Cbam>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            reduction,
            kernel_size,
        } = self;

        if reduction <= 0 || channels / reduction <= 0 {
            return Err(RpnError::InvalidConfig(format!(
                "cannot reduce {} channels by factor {}",
                channels, reduction
            ))
            .into());
        }
        if kernel_size <= 0 || kernel_size % 2 == 0 {
            return Err(RpnError::InvalidConfig(format!(
                "kernel_size must be a positive odd number, but get {}",
                kernel_size
            ))
            .into());
        }

        let hidden = channels / reduction;
        let no_bias = nn::LinearConfig {
            bias: false,
            ..Default::default()
        };
        let fc1 = nn::linear(&(path / "fc") / 0, channels, hidden, no_bias);
        let fc2 = nn::linear(&(path / "fc") / 2, hidden, channels, no_bias);
        let spatial_conv = nn::conv2d(
            path / "conv",
            2,
            1,
            kernel_size,
            nn::ConvConfig {
                padding: kernel_size / 2,
                bias: false,
                ..Default::default()
            },
        );

        Ok(Cbam {
            fc1,
            fc2,
            spatial_conv,
        })
    }
}

/// Convolutional block attention: channel attention followed by spatial attention.
///
/// The output has the same shape as the input.
#[derive(Debug)]
pub struct Cbam {
    fc1: nn::Linear,
    fc2: nn::Linear,
    spatial_conv: nn::Conv2D,
}

impl Cbam {
    fn shared_mlp(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.fc1).relu().apply(&self.fc2)
    }
}

impl nn::ModuleT for Cbam {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        // channel attention
        let xs = {
            let avg = xs.adaptive_avg_pool2d(&[1, 1]).flatten(1, -1);
            let (max, _) = xs.adaptive_max_pool2d(&[1, 1]);
            let max = max.flatten(1, -1);
            let scale = (self.shared_mlp(&avg) + self.shared_mlp(&max))
                .sigmoid()
                .unsqueeze(-1)
                .unsqueeze(-1);
            xs * scale
        };

        // spatial attention
        let avg = xs.mean_dim(&[1], true, Kind::Float);
        let (max, _) = xs.max_dim(1, true);
        let scale = Tensor::cat(&[avg, max], 1)
            .apply(&self.spatial_conv)
            .sigmoid();
        xs * scale
    }
}
