//! Conversion between boxes and anchor-relative regression deltas.
//!
//! A delta row is `[dy, dx, dh, dw]` where
//!
//! ```text
//! dy = (cy - anchor_cy) / anchor_h    dh = ln(h / anchor_h)
//! dx = (cx - anchor_cx) / anchor_w    dw = ln(w / anchor_w)
//! ```
//!
//! [decode] is the exact inverse of [encode] for boxes with positive size.

use crate::{common::*, error::RpnError};

/// Encodes `targets` relative to `anchors` row by row.
///
/// Both inputs must have the same number of boxes. Returns a `[num_boxes, 4]` tensor.
pub fn encode(anchors: &TLBRTensor, targets: &TLBRTensor) -> Result<Tensor> {
    if anchors.num_samples() != targets.num_samples() {
        return Err(RpnError::shape_mismatch(
            "box encoding",
            anchors.num_samples(),
            targets.num_samples(),
        )
        .into());
    }

    let (anchor_cy, anchor_cx, anchor_h, anchor_w) = center_form(anchors);
    let (target_cy, target_cx, target_h, target_w) = center_form(targets);

    let dy = (target_cy - &anchor_cy) / &anchor_h;
    let dx = (target_cx - &anchor_cx) / &anchor_w;
    let dh = (target_h / &anchor_h).log();
    let dw = (target_w / &anchor_w).log();

    Ok(Tensor::stack(&[dy, dx, dh, dw], 1))
}

/// Decodes `[num_boxes, 4]` deltas against `anchors` back to TLBR boxes.
pub fn decode(anchors: &TLBRTensor, deltas: &Tensor) -> Result<TLBRTensor> {
    let (num_deltas, num_params) = deltas.size2()?;
    if num_params != 4 {
        return Err(RpnError::shape_mismatch("box decoding", 4, num_params).into());
    }
    if num_deltas != anchors.num_samples() {
        return Err(
            RpnError::shape_mismatch("box decoding", anchors.num_samples(), num_deltas).into(),
        );
    }

    let (anchor_cy, anchor_cx, anchor_h, anchor_w) = center_form(anchors);
    let deltas = deltas.to_device(anchors.device());
    let dy = deltas.i((.., 0));
    let dx = deltas.i((.., 1));
    let dh = deltas.i((.., 2));
    let dw = deltas.i((.., 3));

    let cy = dy * &anchor_h + anchor_cy;
    let cx = dx * &anchor_w + anchor_cx;
    let h = dh.exp() * anchor_h;
    let w = dw.exp() * anchor_w;

    let t = &cy - &h * 0.5;
    let l = &cx - &w * 0.5;
    let b = &cy + &h * 0.5;
    let r = &cx + &w * 0.5;

    Ok(TLBRTensor::from_tensor_unchecked(Tensor::stack(
        &[t, l, b, r],
        1,
    )))
}

fn center_form(boxes: &TLBRTensor) -> (Tensor, Tensor, Tensor, Tensor) {
    let h = boxes.h();
    let w = boxes.w();
    let cy = boxes.t() + &h * 0.5;
    let cx = boxes.l() + &w * 0.5;
    (cy, cx, h, w)
}
