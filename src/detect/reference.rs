//! A small differentiable reference detector.
//!
//! One candidate per cell of a regular grid. A candidate's logit is an
//! affine function of the mean intensity of its cell, squashed through a
//! sigmoid; class scores use per-class bias offsets so classes are
//! distinguishable. Smooth everywhere, with an exact analytic input
//! gradient, which makes it suitable for end-to-end dry runs, determinism
//! tests and gradient checks without any external model runtime.

use ndarray::{Array2, Array3, Array4, ArrayView4};

use super::{Detector, DetectorOutput, DetectorPass, DetectorTape};

/// Grid-pooling detector with sigmoid scoring.
#[derive(Clone, Debug)]
pub struct PoolingDetector {
    /// Grid cells per axis; candidates = grid * grid.
    pub grid: usize,

    pub classes: usize,

    /// Logit gain on the cell mean.
    pub gain: f32,

    /// Objectness logit bias.
    pub obj_bias: f32,

    /// Class k logit bias is `obj_bias + cls_bias_step * k`.
    pub cls_bias_step: f32,
}

impl PoolingDetector {
    pub fn new(grid: usize, classes: usize) -> Self {
        Self {
            grid,
            classes,
            gain: 4.0,
            obj_bias: -1.0,
            cls_bias_step: -0.05,
        }
    }

    fn cell_bounds(&self, d: usize, h: usize, w: usize) -> (usize, usize, usize, usize) {
        let (gy, gx) = (d / self.grid, d % self.grid);
        let y0 = gy * h / self.grid;
        let y1 = (gy + 1) * h / self.grid;
        let x0 = gx * w / self.grid;
        let x1 = (gx + 1) * w / self.grid;
        (y0, y1, x0, x1)
    }
}

fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

struct PoolingTape {
    detector: PoolingDetector,
    shape: (usize, usize, usize, usize),
    output: DetectorOutput,
}

impl DetectorTape for PoolingTape {
    fn vjp(&self, grad_obj: &Array2<f32>, grad_cls: &Array3<f32>) -> Array4<f32> {
        let (n, c, h, w) = self.shape;
        let det = &self.detector;
        let candidates = det.grid * det.grid;
        let mut grad = Array4::zeros((n, c, h, w));

        for i in 0..n {
            for d in 0..candidates {
                let (y0, y1, x0, x1) = det.cell_bounds(d, h, w);
                let cell_px = (c * (y1 - y0) * (x1 - x0)) as f32;
                if cell_px == 0.0 {
                    continue;
                }

                // d score / d mean for every score reading this cell.
                let obj = self.output.objectness[[i, d]];
                let mut dmean = grad_obj[[i, d]] * obj * (1.0 - obj) * det.gain;
                for k in 0..det.classes {
                    let s = self.output.class_scores[[i, d, k]];
                    dmean += grad_cls[[i, d, k]] * s * (1.0 - s) * det.gain;
                }
                if dmean == 0.0 {
                    continue;
                }

                // d mean / d pixel is uniform over the cell.
                let per_px = dmean / cell_px;
                for ch in 0..c {
                    for y in y0..y1 {
                        for x in x0..x1 {
                            grad[[i, ch, y, x]] += per_px;
                        }
                    }
                }
            }
        }
        grad
    }
}

impl Detector for PoolingDetector {
    fn forward(&self, images: &ArrayView4<f32>) -> anyhow::Result<DetectorPass> {
        let s = images.shape();
        let (n, c, h, w) = (s[0], s[1], s[2], s[3]);
        anyhow::ensure!(
            h >= self.grid && w >= self.grid,
            "input {h}x{w} smaller than detector grid {}",
            self.grid
        );

        let candidates = self.grid * self.grid;
        let mut objectness = Array2::zeros((n, candidates));
        let mut class_scores = Array3::zeros((n, candidates, self.classes));

        for i in 0..n {
            for d in 0..candidates {
                let (y0, y1, x0, x1) = self.cell_bounds(d, h, w);
                let mut sum = 0.0f32;
                for ch in 0..c {
                    for y in y0..y1 {
                        for x in x0..x1 {
                            sum += images[[i, ch, y, x]];
                        }
                    }
                }
                let mean = sum / (c * (y1 - y0) * (x1 - x0)) as f32;
                objectness[[i, d]] = sigmoid(self.gain * mean + self.obj_bias);
                for k in 0..self.classes {
                    let bias = self.obj_bias + self.cls_bias_step * k as f32;
                    class_scores[[i, d, k]] = sigmoid(self.gain * mean + bias);
                }
            }
        }

        let output = DetectorOutput {
            objectness,
            class_scores,
        };
        Ok(DetectorPass {
            output: output.clone(),
            tape: Box::new(PoolingTape {
                detector: self.clone(),
                shape: (n, c, h, w),
                output,
            }),
        })
    }

    fn num_classes(&self) -> usize {
        self.classes
    }
}
