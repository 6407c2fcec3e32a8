//! Non-printability score.
//!
//! Physical printers reproduce only a limited palette. For every patch
//! pixel the loss takes the Euclidean distance to the nearest colour of a
//! reference palette and averages over pixels: zero iff every pixel matches
//! a printable colour exactly, growing as the patch drifts into
//! unreproducible colours.
//!
//! The palette file is a flat list of `r,g,b` triplets in [0,1], one per
//! line; `#` comments and blank lines are ignored.

use std::path::Path;

use anyhow::{bail, Context};
use ndarray::{Array2, Array3, ArrayView3};

/// Printability loss against a fixed reference palette.
pub struct NpsLoss {
    /// (colours, 3) palette in [0, 1].
    palette: Array2<f32>,
}

impl NpsLoss {
    pub fn new(palette: Array2<f32>) -> anyhow::Result<Self> {
        if palette.nrows() == 0 {
            bail!("printable palette is empty");
        }
        if palette.ncols() != 3 {
            bail!("printable palette must have 3 columns, got {}", palette.ncols());
        }
        Ok(Self { palette })
    }

    /// Load the palette from a triplet file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading printability file {}", path.display()))?;
        let mut colours = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() != 3 {
                bail!(
                    "{}:{}: expected 3 comma-separated values, got {}",
                    path.display(),
                    lineno + 1,
                    parts.len()
                );
            }
            for p in &parts {
                let v: f32 = p.parse().with_context(|| {
                    format!("{}:{}: invalid component {p:?}", path.display(), lineno + 1)
                })?;
                if !(0.0..=1.0).contains(&v) {
                    bail!(
                        "{}:{}: component {v} outside [0, 1]",
                        path.display(),
                        lineno + 1
                    );
                }
                colours.push(v);
            }
        }
        if colours.is_empty() {
            bail!("printability file {} holds no colours", path.display());
        }
        let n = colours.len() / 3;
        let palette = Array2::from_shape_vec((n, 3), colours)?;
        Self::new(palette)
    }

    pub fn num_colours(&self) -> usize {
        self.palette.nrows()
    }

    /// Mean over pixels of the distance to the nearest palette colour.
    pub fn forward(&self, patch: &ArrayView3<f32>) -> f32 {
        let (h, w) = (patch.shape()[1], patch.shape()[2]);
        let mut total = 0.0f32;
        for y in 0..h {
            for x in 0..w {
                total += self.nearest(patch, y, x).1;
            }
        }
        total / (h * w) as f32
    }

    /// Gradient of `forward` with respect to the patch.
    pub fn gradient(&self, patch: &ArrayView3<f32>) -> Array3<f32> {
        let (h, w) = (patch.shape()[1], patch.shape()[2]);
        let mut grad = Array3::zeros((3, h, w));
        let scale = 1.0 / (h * w) as f32;
        for y in 0..h {
            for x in 0..w {
                let (idx, dist) = self.nearest(patch, y, x);
                if dist <= 1e-8 {
                    // Exactly printable pixel: the distance has no descent
                    // direction here.
                    continue;
                }
                for c in 0..3 {
                    grad[[c, y, x]] =
                        scale * (patch[[c, y, x]] - self.palette[[idx, c]]) / dist;
                }
            }
        }
        grad
    }

    /// Nearest palette colour index and distance for one pixel.
    fn nearest(&self, patch: &ArrayView3<f32>, y: usize, x: usize) -> (usize, f32) {
        let mut best = (0usize, f32::INFINITY);
        for (idx, colour) in self.palette.outer_iter().enumerate() {
            let mut d2 = 0.0f32;
            for c in 0..3 {
                let diff = patch[[c, y, x]] - colour[c];
                d2 += diff * diff;
            }
            let d = d2.sqrt();
            if d < best.1 {
                best = (idx, d);
            }
        }
        best
    }
}
