//! Dense anchor grid generation.

use crate::{common::*, error::RpnError};

/// Aspect ratios and scales of the anchors placed at every grid position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnchorConfig {
    /// Height-to-width ratios.
    #[serde(default = "default_ratios")]
    pub ratios: Vec<R64>,
    /// Anchor sizes in units of the feature stride.
    #[serde(default = "default_scales")]
    pub scales: Vec<R64>,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            ratios: default_ratios(),
            scales: default_scales(),
        }
    }
}

fn default_ratios() -> Vec<R64> {
    vec![r64(0.5), r64(1.0), r64(2.0)]
}

fn default_scales() -> Vec<R64> {
    vec![r64(8.0), r64(16.0), r64(32.0)]
}

/// The feature map and input image dimensions an anchor set is laid out for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridLayout {
    pub feature_h: i64,
    pub feature_w: i64,
    pub image_h: i64,
    pub image_w: i64,
}

impl GridLayout {
    /// Builds the layout from a `[batch, channels, height, width]` feature
    /// tensor and the input image size.
    pub fn from_features(features: &Tensor, image_h: i64, image_w: i64) -> Result<Self> {
        let (_b, _c, feature_h, feature_w) = features.size4()?;
        let layout = Self {
            feature_h,
            feature_w,
            image_h,
            image_w,
        };
        layout.validate()?;
        Ok(layout)
    }

    pub fn num_positions(&self) -> i64 {
        self.feature_h * self.feature_w
    }

    /// Vertical and horizontal stride in image pixels.
    pub fn strides(&self) -> (f64, f64) {
        (
            self.image_h as f64 / self.feature_h as f64,
            self.image_w as f64 / self.feature_w as f64,
        )
    }

    fn validate(&self) -> Result<()> {
        let Self {
            feature_h,
            feature_w,
            image_h,
            image_w,
        } = *self;
        if feature_h <= 0 || feature_w <= 0 || image_h <= 0 || image_w <= 0 {
            return Err(RpnError::InvalidConfig(format!(
                "grid dimensions must be positive, but get {:?}",
                self
            ))
            .into());
        }
        Ok(())
    }
}

/// An immutable, ordered set of anchor boxes.
///
/// Anchor `i` lives at grid position `i / num_per_position` in row-major
/// order, and within a position the ratios iterate in the outer loop and the
/// scales in the inner loop. The network output uses the same order.
#[derive(Debug)]
pub struct AnchorSet {
    layout: GridLayout,
    num_per_position: i64,
    boxes: TLBRTensor,
    valid_indexes: Vec<i64>,
}

impl AnchorSet {
    pub fn len(&self) -> i64 {
        self.boxes.num_samples()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn num_per_position(&self) -> i64 {
        self.num_per_position
    }

    pub fn boxes(&self) -> &TLBRTensor {
        &self.boxes
    }

    pub fn device(&self) -> Device {
        self.boxes.device()
    }

    /// Positions of anchors lying entirely inside the image, in ascending order.
    pub fn valid_indexes(&self) -> &[i64] {
        &self.valid_indexes
    }

    /// Fails with [RpnError::ShapeMismatch] unless `count` equals the anchor count.
    pub fn check_count(&self, context: &'static str, count: i64) -> Result<()> {
        if count != self.len() {
            return Err(RpnError::shape_mismatch(context, self.len(), count).into());
        }
        Ok(())
    }
}

/// Produces [AnchorSet]s for a fixed ratio and scale configuration.
#[derive(Debug, Clone)]
pub struct AnchorGenerator {
    ratios: Vec<f64>,
    scales: Vec<f64>,
}

impl AnchorGenerator {
    pub fn new(config: &AnchorConfig) -> Result<Self> {
        let AnchorConfig { ratios, scales } = config;

        if ratios.is_empty() || scales.is_empty() {
            return Err(RpnError::InvalidConfig(
                "anchor ratios and scales must not be empty".into(),
            )
            .into());
        }
        if ratios.iter().chain(scales).any(|value| value.raw() <= 0.0) {
            return Err(RpnError::InvalidConfig(
                "anchor ratios and scales must be positive".into(),
            )
            .into());
        }

        Ok(Self {
            ratios: ratios.iter().map(|ratio| ratio.raw()).collect(),
            scales: scales.iter().map(|scale| scale.raw()).collect(),
        })
    }

    pub fn num_per_position(&self) -> i64 {
        (self.ratios.len() * self.scales.len()) as i64
    }

    /// Lays out anchors over the grid.
    ///
    /// Centers sit at `stride / 2 + k * stride` on each axis. An anchor with
    /// ratio `r` and scale `s` has height `stride_y * s * sqrt(r)` and width
    /// `stride_x * s * sqrt(1 / r)`. The output is deterministic.
    pub fn generate(&self, layout: &GridLayout, device: Device) -> Result<AnchorSet> {
        layout.validate()?;

        let GridLayout {
            feature_h,
            feature_w,
            image_h,
            image_w,
        } = *layout;
        let (stride_y, stride_x) = layout.strides();
        let num_anchors = layout.num_positions() * self.num_per_position();

        let mut values: Vec<f32> = Vec::with_capacity(num_anchors as usize * 4);
        let mut valid_indexes = vec![];

        for row in 0..feature_h {
            let cy = stride_y / 2.0 + row as f64 * stride_y;

            for col in 0..feature_w {
                let cx = stride_x / 2.0 + col as f64 * stride_x;

                for &ratio in &self.ratios {
                    for &scale in &self.scales {
                        let h = stride_y * scale * ratio.sqrt();
                        let w = stride_x * scale * (1.0 / ratio).sqrt();
                        let t = (cy - h / 2.0) as f32;
                        let l = (cx - w / 2.0) as f32;
                        let b = (cy + h / 2.0) as f32;
                        let r = (cx + w / 2.0) as f32;

                        if t >= 0.0 && l >= 0.0 && b <= image_h as f32 && r <= image_w as f32 {
                            valid_indexes.push((values.len() / 4) as i64);
                        }
                        values.extend([t, l, b, r]);
                    }
                }
            }
        }
        debug_assert_eq!(values.len(), num_anchors as usize * 4);

        let boxes = TLBRTensor::from_tensor_unchecked(
            Tensor::of_slice(&values)
                .view([num_anchors, 4])
                .to_device(device),
        );

        debug!(
            "generated {} anchors ({} inside image) for layout {:?}",
            num_anchors,
            valid_indexes.len(),
            layout
        );

        Ok(AnchorSet {
            layout: *layout,
            num_per_position: self.num_per_position(),
            boxes,
            valid_indexes,
        })
    }
}
