use super::{Rect, TLBR};
use crate::common::*;

/// The union floor used by [TLBRTensor::iou_matrix].
pub const IOU_EPSILON: f64 = 1e-9;

/// Checked tensor of batched boxes in TLBR format.
///
/// The boxes are stored in a single `[num_boxes, 4]` float tensor whose columns
/// are top, left, bottom and right.
#[derive(Debug)]
pub struct TLBRTensor {
    tlbr: Tensor,
}

impl TLBRTensor {
    /// Wraps a `[num_boxes, 4]` float tensor.
    ///
    /// It fails if the shape is wrong or if any box has bottom < top or right < left.
    pub fn from_tensor(tlbr: Tensor) -> Result<Self> {
        let size = tlbr.size();
        ensure!(
            size.len() == 2 && size[1] == 4,
            "expect a [num_boxes, 4] tensor, but get shape {:?}",
            size
        );
        ensure!(
            matches!(tlbr.kind(), Kind::Float | Kind::Double),
            "expect a float tensor, but get {:?}",
            tlbr.kind()
        );

        let boxes = Self { tlbr };
        ensure!(boxes.is_well_formed(), "b >= t and r >= l must hold");
        Ok(boxes)
    }

    /// Wraps a `[num_boxes, 4]` tensor without checking the box ordering.
    ///
    /// Network predictions decoded from deltas always satisfy the ordering,
    /// so the check is skipped on the hot path.
    pub fn from_tensor_unchecked(tlbr: Tensor) -> Self {
        debug_assert!({
            let size = tlbr.size();
            size.len() == 2 && size[1] == 4
        });
        Self { tlbr }
    }

    pub fn from_rects<R>(rects: &[R], device: Device) -> Self
    where
        R: Rect<Type = f64>,
    {
        let values: Vec<f32> = rects
            .iter()
            .flat_map(|rect| [rect.t(), rect.l(), rect.b(), rect.r()])
            .map(|value| value as f32)
            .collect();
        let tlbr = Tensor::of_slice(&values)
            .view([rects.len() as i64, 4])
            .to_device(device);
        Self { tlbr }
    }

    pub fn empty(device: Device) -> Self {
        Self {
            tlbr: Tensor::zeros(&[0, 4], (Kind::Float, device)),
        }
    }

    pub fn num_samples(&self) -> i64 {
        self.tlbr.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples() == 0
    }

    pub fn device(&self) -> Device {
        self.tlbr.device()
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tlbr
    }

    pub fn into_tensor(self) -> Tensor {
        self.tlbr
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            tlbr: self.tlbr.to_device(device),
        }
    }

    /// The top parameter in shape `[num_boxes]`.
    pub fn t(&self) -> Tensor {
        self.tlbr.i((.., 0))
    }

    /// The left parameter in shape `[num_boxes]`.
    pub fn l(&self) -> Tensor {
        self.tlbr.i((.., 1))
    }

    /// The bottom parameter in shape `[num_boxes]`.
    pub fn b(&self) -> Tensor {
        self.tlbr.i((.., 2))
    }

    /// The right parameter in shape `[num_boxes]`.
    pub fn r(&self) -> Tensor {
        self.tlbr.i((.., 3))
    }

    pub fn h(&self) -> Tensor {
        self.b() - self.t()
    }

    pub fn w(&self) -> Tensor {
        self.r() - self.l()
    }

    pub fn area(&self) -> Tensor {
        self.h() * self.w()
    }

    pub fn index_select(&self, indexes: &Tensor) -> Self {
        Self {
            tlbr: self.tlbr.index_select(0, indexes),
        }
    }

    pub fn is_well_formed(&self) -> bool {
        if self.is_empty() {
            return true;
        }
        let h_ok = bool::from(self.h().ge(0.0).all());
        let w_ok = bool::from(self.w().ge(0.0).all());
        h_ok && w_ok
    }

    /// Computes pairwise IoU values against `other`.
    ///
    /// The output has shape `[self.num_samples(), other.num_samples()]`. The
    /// union is floored at [IOU_EPSILON], hence zero-area pairs produce zero
    /// rather than NaN.
    pub fn iou_matrix(&self, other: &Self) -> Tensor {
        let n = self.num_samples();
        let m = other.num_samples();
        let device = self.device();

        if n == 0 || m == 0 {
            return Tensor::zeros(&[n, m], (Kind::Float, device));
        }

        let lhs = &self.tlbr;
        let rhs = other.tlbr.to_device(device);

        // [n, 1] against [1, m]
        let max_t = lhs.i((.., 0..1)).maximum(&rhs.i((.., 0)).unsqueeze(0));
        let max_l = lhs.i((.., 1..2)).maximum(&rhs.i((.., 1)).unsqueeze(0));
        let min_b = lhs.i((.., 2..3)).minimum(&rhs.i((.., 2)).unsqueeze(0));
        let min_r = lhs.i((.., 3..4)).minimum(&rhs.i((.., 3)).unsqueeze(0));

        let inter_h = (min_b - max_t).clamp_min(0.0);
        let inter_w = (min_r - max_l).clamp_min(0.0);
        let inter_area = inter_h * inter_w;

        let lhs_area = self.area().unsqueeze(1);
        let rhs_area = other.area().to_device(device).unsqueeze(0);
        let union_area = (lhs_area + rhs_area - &inter_area).clamp_min(IOU_EPSILON);

        inter_area / union_area
    }

    /// Copies the boxes back to host memory.
    pub fn to_rects(&self) -> Vec<TLBR<f64>> {
        let values = Vec::<f32>::from(&self.tlbr.to_kind(Kind::Float).contiguous().view([-1]));
        values
            .chunks(4)
            .map(|tlbr| TLBR {
                t: tlbr[0] as f64,
                l: tlbr[1] as f64,
                b: tlbr[2] as f64,
                r: tlbr[3] as f64,
            })
            .collect()
    }
}

impl Clone for TLBRTensor {
    fn clone(&self) -> Self {
        Self {
            tlbr: self.tlbr.shallow_clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RectFloat, RectNum};
    use approx::assert_abs_diff_eq;

    fn boxes(values: &[[f64; 4]]) -> TLBRTensor {
        let rects: Vec<_> = values.iter().map(|tlbr| TLBR::from_tlbr(*tlbr)).collect();
        TLBRTensor::from_rects(&rects, Device::Cpu)
    }

    #[test]
    fn reject_bad_shape_and_order() {
        let bad_shape = Tensor::zeros(&[3, 3], (Kind::Float, Device::Cpu));
        assert!(TLBRTensor::from_tensor(bad_shape).is_err());

        let bad_order = Tensor::of_slice(&[5f32, 0.0, 1.0, 4.0]).view([1, 4]);
        assert!(TLBRTensor::from_tensor(bad_order).is_err());
    }

    #[test]
    fn self_and_disjoint_iou() {
        let lhs = boxes(&[[0.0, 0.0, 10.0, 10.0], [100.0, 100.0, 120.0, 130.0]]);
        let iou = Vec::<f32>::from(&lhs.iou_matrix(&lhs).view([-1]));
        assert_abs_diff_eq!(iou[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(iou[1], 0.0);
        assert_abs_diff_eq!(iou[2], 0.0);
        assert_abs_diff_eq!(iou[3], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn iou_matrix_is_symmetric() {
        let lhs = boxes(&[
            [0.0, 0.0, 10.0, 10.0],
            [5.0, 5.0, 15.0, 25.0],
            [2.0, 3.0, 4.0, 50.0],
        ]);
        let rhs = boxes(&[[1.0, 1.0, 9.0, 12.0], [6.0, 0.0, 30.0, 7.0]]);

        let forward = lhs.iou_matrix(&rhs);
        let backward = rhs.iou_matrix(&lhs);
        assert_eq!(forward.size(), vec![3, 2]);
        assert_eq!(backward.size(), vec![2, 3]);

        let diff = f64::from((forward - backward.transpose(0, 1)).abs().max());
        assert_abs_diff_eq!(diff, 0.0, epsilon = 1e-7);
    }

    #[test]
    fn matches_scalar_iou() {
        let values = [
            [0.0, 0.0, 10.0, 10.0],
            [5.0, 5.0, 15.0, 25.0],
            [2.0, 3.0, 4.0, 50.0],
        ];
        let lhs = boxes(&values);
        let iou = Vec::<f32>::from(&lhs.iou_matrix(&lhs).view([-1]));

        for (i, a) in values.iter().enumerate() {
            for (j, b) in values.iter().enumerate() {
                let expect = TLBR::from_tlbr(*a).iou_with(&TLBR::from_tlbr(*b), IOU_EPSILON);
                assert_abs_diff_eq!(iou[i * 3 + j] as f64, expect, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn degenerate_boxes_produce_zero() {
        let lhs = boxes(&[[3.0, 3.0, 3.0, 3.0], [0.0, 0.0, 10.0, 0.0]]);
        let iou = lhs.iou_matrix(&lhs);
        assert!(bool::from(iou.isfinite().all()));
        assert_abs_diff_eq!(f64::from(iou.abs().max()), 0.0);
    }

    #[test]
    fn empty_operand() {
        let lhs = boxes(&[[0.0, 0.0, 10.0, 10.0]]);
        let rhs = TLBRTensor::empty(Device::Cpu);
        assert_eq!(lhs.iou_matrix(&rhs).size(), vec![1, 0]);
        assert_eq!(rhs.iou_matrix(&lhs).size(), vec![0, 1]);
    }
}
