//! Saliency loss: the Hasler–Süsstrunk colourfulness metric.
//!
//! On the opponent axes rg = R − G and yb = ½(R + G) − B the metric is
//! `sigma + 0.3·mu`, where sigma aggregates the standard deviations and mu
//! the mean magnitudes of the two axes. The smaller the value, the less
//! colourful (and less visually salient) the patch. Optional term; the
//! trainer only evaluates it when its weight is non-zero.

use ndarray::{Array2, Array3, ArrayView3};

const MU_WEIGHT: f32 = 0.3;
const EPS: f32 = 1e-8;

/// Colourfulness of the patch.
pub struct SaliencyLoss;

impl SaliencyLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn forward(&self, patch: &ArrayView3<f32>) -> f32 {
        let (rg, yb) = opponent_axes(patch);
        let (mu_rg, var_rg) = mean_var(&rg);
        let (mu_yb, var_yb) = mean_var(&yb);
        let sigma = (var_rg + var_yb).sqrt();
        let mu = (mu_rg * mu_rg + mu_yb * mu_yb).sqrt();
        sigma + MU_WEIGHT * mu
    }

    pub fn gradient(&self, patch: &ArrayView3<f32>) -> Array3<f32> {
        let (h, w) = (patch.shape()[1], patch.shape()[2]);
        let n = (h * w) as f32;
        let (rg, yb) = opponent_axes(patch);
        let (mu_rg, var_rg) = mean_var(&rg);
        let (mu_yb, var_yb) = mean_var(&yb);
        let sigma = (var_rg + var_yb).sqrt();
        let mu = (mu_rg * mu_rg + mu_yb * mu_yb).sqrt();

        let mut grad = Array3::zeros((3, h, w));
        for y in 0..h {
            for x in 0..w {
                // d loss / d rg and d loss / d yb at this pixel.
                let mut d_rg = 0.0;
                let mut d_yb = 0.0;
                if sigma > EPS {
                    d_rg += (rg[[y, x]] - mu_rg) / (n * sigma);
                    d_yb += (yb[[y, x]] - mu_yb) / (n * sigma);
                }
                if mu > EPS {
                    d_rg += MU_WEIGHT * mu_rg / (n * mu);
                    d_yb += MU_WEIGHT * mu_yb / (n * mu);
                }
                // rg = R - G, yb = (R + G)/2 - B.
                grad[[0, y, x]] = d_rg + 0.5 * d_yb;
                grad[[1, y, x]] = -d_rg + 0.5 * d_yb;
                grad[[2, y, x]] = -d_yb;
            }
        }
        grad
    }
}

impl Default for SaliencyLoss {
    fn default() -> Self {
        Self::new()
    }
}

fn opponent_axes(patch: &ArrayView3<f32>) -> (Array2<f32>, Array2<f32>) {
    let (h, w) = (patch.shape()[1], patch.shape()[2]);
    let rg = Array2::from_shape_fn((h, w), |(y, x)| patch[[0, y, x]] - patch[[1, y, x]]);
    let yb = Array2::from_shape_fn((h, w), |(y, x)| {
        0.5 * (patch[[0, y, x]] + patch[[1, y, x]]) - patch[[2, y, x]]
    });
    (rg, yb)
}

/// Population mean and variance.
fn mean_var(a: &Array2<f32>) -> (f32, f32) {
    let n = a.len() as f32;
    let mean = a.iter().sum::<f32>() / n;
    let var = a.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, var)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_gray_patch_is_zero() {
        let sal = SaliencyLoss::new();
        let patch = Array3::from_elem((3, 8, 8), 0.5);
        assert!(sal.forward(&patch.view()) < 1e-7);
        assert!(sal.gradient(&patch.view()).iter().all(|&v| v.abs() < 1e-7));
    }

    #[test]
    fn test_saturated_red_is_colourful() {
        let sal = SaliencyLoss::new();
        let patch = Array3::from_shape_fn((3, 4, 4), |(c, _, _)| if c == 0 { 1.0 } else { 0.0 });
        // rg = 1 everywhere: mu contribution alone is 0.3 * sqrt(1 + 0.25).
        let loss = sal.forward(&patch.view());
        let expected = MU_WEIGHT * (1.0f32 + 0.25).sqrt();
        assert!((loss - expected).abs() < 1e-5, "loss = {loss}");
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let sal = SaliencyLoss::new();
        // Red-shifted irregular patch: both sigma and mu are well away from
        // their non-differentiable zeros.
        let patch = Array3::from_shape_fn((3, 4, 4), |(c, y, x)| match c {
            0 => 0.6 + 0.05 * ((y * 4 + x) % 5) as f32,
            1 => 0.3 + 0.04 * ((y + x) % 3) as f32,
            _ => 0.2 + 0.03 * ((y * 2 + x) % 4) as f32,
        });
        let grad = sal.gradient(&patch.view());

        for &(c, y, x) in &[(0usize, 0usize, 0usize), (1, 2, 3), (2, 3, 1)] {
            let eps = 1e-2;
            let mut plus = patch.clone();
            plus[[c, y, x]] += eps;
            let mut minus = patch.clone();
            minus[[c, y, x]] -= eps;
            let fd = (sal.forward(&plus.view()) - sal.forward(&minus.view())) / (2.0 * eps);
            let an = grad[[c, y, x]];
            assert!((fd - an).abs() < 2e-3, "({c},{y},{x}): fd={fd} an={an}");
        }
    }
}
