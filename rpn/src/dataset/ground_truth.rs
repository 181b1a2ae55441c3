use crate::{common::*, error::RpnError};

/// The label value assigned to every annotated object.
pub const OBJECT_LABEL: i64 = 1;

/// Annotated objects of one image.
///
/// The vectors are parallel: `boxes[i]`, `labels[i]` and `names[i]` describe
/// the same object. Boxes are in image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruth {
    pub boxes: Vec<TLBR<f64>>,
    pub labels: Vec<i64>,
    pub names: Vec<String>,
    /// Position of the image in its dataset.
    pub index: usize,
}

impl GroundTruth {
    pub fn empty(index: usize) -> Self {
        Self {
            boxes: vec![],
            labels: vec![],
            names: vec![],
            index,
        }
    }

    /// Builds the record from `(category, [t, l, b, r])` pairs.
    ///
    /// A box with bottom < top or right < left fails with [RpnError::MalformedBox].
    pub fn new<I, S>(index: usize, objects: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, [f64; 4])>,
        S: Into<String>,
    {
        let (boxes, names): (Vec<_>, Vec<_>) = objects
            .into_iter()
            .map(|(name, tlbr)| -> Result<_> {
                let rect = TLBR::try_from_tlbr(tlbr).map_err(|_| {
                    let [t, l, b, r] = tlbr;
                    RpnError::MalformedBox { t, l, b, r }
                })?;
                Ok((rect, name.into()))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();
        let labels = vec![OBJECT_LABEL; boxes.len()];

        Ok(Self {
            boxes,
            labels,
            names,
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Rescales the boxes by per-axis factors, e.g. after resizing the image.
    pub fn scale_hw(&self, scale_h: f64, scale_w: f64) -> Result<Self> {
        let boxes = self
            .boxes
            .iter()
            .map(|rect| rect.try_scale_hw(scale_h, scale_w))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            boxes,
            ..self.clone()
        })
    }

    pub fn to_tensor(&self, device: Device) -> TLBRTensor {
        TLBRTensor::from_rects(&self.boxes, device)
    }
}
