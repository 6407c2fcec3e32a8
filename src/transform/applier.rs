//! Alpha compositing of transformed patch instances onto images.
//!
//! Instances are drawn sequentially in label order, later instances on top,
//! each blended with the configured opacity. A canvas pixel belongs to an
//! instance's footprint iff any of its channels is non-zero (the warp keeps
//! footprint pixels strictly positive).
//!
//! The backward pass walks instances in reverse, tracking how much of each
//! instance's contribution survives the instances drawn over it.

use ndarray::{Array2, Array4, Array5, ArrayView4, ArrayView5};

/// Footprint masks needed by the backward pass.
pub struct ApplyRecord {
    /// (batch, max_labels) per-pixel footprint masks.
    masks: Vec<Vec<Array2<bool>>>,

    alpha: f32,
}

/// Composites transformed patch instances onto an image batch.
pub struct PatchApplier {
    /// Blend weight: 1.0 pastes opaquely, 0.0 leaves images untouched.
    alpha: f32,
}

impl PatchApplier {
    pub fn new(alpha: f32) -> Self {
        Self { alpha }
    }

    /// Blend every instance onto its image. Images without valid instances
    /// are returned unchanged. Output values stay in the image range, since
    /// each blend is a convex combination of in-range inputs.
    pub fn apply(
        &self,
        images: &ArrayView4<f32>,
        instances: &ArrayView5<f32>,
    ) -> (Array4<f32>, ApplyRecord) {
        let (n, m) = (instances.shape()[0], instances.shape()[1]);
        let (h, w) = (images.shape()[2], images.shape()[3]);
        let mut out = images.to_owned();
        let mut masks = Vec::with_capacity(n);

        for i in 0..n {
            let mut row = Vec::with_capacity(m);
            for j in 0..m {
                let mut mask = Array2::from_elem((h, w), false);
                for y in 0..h {
                    for x in 0..w {
                        let covered = (0..3).any(|c| instances[[i, j, c, y, x]] != 0.0);
                        if covered {
                            mask[[y, x]] = true;
                            for c in 0..3 {
                                let img = out[[i, c, y, x]];
                                let inst = instances[[i, j, c, y, x]];
                                out[[i, c, y, x]] =
                                    (1.0 - self.alpha) * img + self.alpha * inst;
                            }
                        }
                    }
                }
                row.push(mask);
            }
            masks.push(row);
        }

        (
            out,
            ApplyRecord {
                masks,
                alpha: self.alpha,
            },
        )
    }

    /// Gradient with respect to the instance batch.
    ///
    /// Instance j's contribution at a pixel is attenuated by (1 - alpha)
    /// for every later instance covering the same pixel, so the walk runs
    /// last-to-first with a running attenuation map.
    pub fn backward(&self, record: &ApplyRecord, grad_out: &ArrayView4<f32>) -> Array5<f32> {
        let n = record.masks.len();
        let m = record.masks.first().map_or(0, Vec::len);
        let (h, w) = (grad_out.shape()[2], grad_out.shape()[3]);
        let alpha = record.alpha;

        let mut grad = Array5::zeros((n, m, 3, h, w));
        for i in 0..n {
            let mut attenuation = Array2::from_elem((h, w), 1.0f32);
            for j in (0..m).rev() {
                let mask = &record.masks[i][j];
                for y in 0..h {
                    for x in 0..w {
                        if mask[[y, x]] {
                            let a = attenuation[[y, x]];
                            for c in 0..3 {
                                grad[[i, j, c, y, x]] = grad_out[[i, c, y, x]] * alpha * a;
                            }
                            attenuation[[y, x]] = a * (1.0 - alpha);
                        }
                    }
                }
            }
        }
        grad
    }
}
