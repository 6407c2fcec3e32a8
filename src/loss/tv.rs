//! Total variation smoothness loss.
//!
//! Mean absolute difference between each pixel and its right and bottom
//! neighbours, normalized by pixel count. Zero iff every channel is
//! constant; strictly positive otherwise. Penalizing high-frequency
//! structure keeps the patch physically reproducible.

use ndarray::{Array3, ArrayView3};

/// Smoothness loss over the patch.
pub struct TotalVariationLoss;

impl TotalVariationLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn forward(&self, patch: &ArrayView3<f32>) -> f32 {
        let (h, w) = (patch.shape()[1], patch.shape()[2]);
        let mut total = 0.0f32;
        for c in 0..3 {
            for y in 0..h {
                for x in 0..w {
                    let v = patch[[c, y, x]];
                    if x + 1 < w {
                        total += (patch[[c, y, x + 1]] - v).abs();
                    }
                    if y + 1 < h {
                        total += (patch[[c, y + 1, x]] - v).abs();
                    }
                }
            }
        }
        total / (3 * h * w) as f32
    }

    /// Signed neighbour-stencil gradient of `forward`.
    pub fn gradient(&self, patch: &ArrayView3<f32>) -> Array3<f32> {
        let (h, w) = (patch.shape()[1], patch.shape()[2]);
        let mut grad = Array3::zeros((3, h, w));
        let scale = 1.0 / (3 * h * w) as f32;
        for c in 0..3 {
            for y in 0..h {
                for x in 0..w {
                    let v = patch[[c, y, x]];
                    if x + 1 < w {
                        let s = (patch[[c, y, x + 1]] - v).signum_or_zero();
                        grad[[c, y, x + 1]] += scale * s;
                        grad[[c, y, x]] -= scale * s;
                    }
                    if y + 1 < h {
                        let s = (patch[[c, y + 1, x]] - v).signum_or_zero();
                        grad[[c, y + 1, x]] += scale * s;
                        grad[[c, y, x]] -= scale * s;
                    }
                }
            }
        }
        grad
    }
}

impl Default for TotalVariationLoss {
    fn default() -> Self {
        Self::new()
    }
}

trait SignumOrZero {
    fn signum_or_zero(self) -> f32;
}

impl SignumOrZero for f32 {
    /// `signum` with a zero subgradient at zero (f32::signum(0.0) is 1.0).
    fn signum_or_zero(self) -> f32 {
        if self == 0.0 {
            0.0
        } else {
            self.signum()
        }
    }
}
