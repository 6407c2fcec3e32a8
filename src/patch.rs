//! The adversarial patch — the single trainable parameter.
//!
//! A 3×H×W f32 buffer constrained to [0, 1]. The optimizer mutates it in
//! place every step; `clamp_unit` is the post-step projection back onto the
//! feasible box. Everything else in the crate only reads it.

use std::path::Path;

use anyhow::Context;
use image::{imageops::FilterType, Rgb, RgbImage};
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::PatchSource;

/// The trainable patch parameter.
#[derive(Clone, Debug)]
pub struct AdvPatch {
    /// Pixel data, shape (3, height, width), values in [0, 1].
    pub data: Array3<f32>,
}

impl AdvPatch {
    /// Construct the initial patch from the configured source.
    pub fn from_source(source: &PatchSource, size: [usize; 2], seed: u64) -> anyhow::Result<Self> {
        let [h, w] = size;
        let data = match source {
            PatchSource::Gray => Array3::from_elem((3, h, w), 0.5),
            PatchSource::Random => {
                let mut rng = StdRng::seed_from_u64(seed);
                Array3::from_shape_fn((3, h, w), |_| rng.gen::<f32>())
            }
            PatchSource::File(path) => return Self::load(path, size),
        };
        Ok(Self { data })
    }

    /// Load a patch from an image file, resized to the target size.
    pub fn load(path: &Path, size: [usize; 2]) -> anyhow::Result<Self> {
        let [h, w] = size;
        let img = image::open(path)
            .with_context(|| format!("reading patch image {}", path.display()))?
            .to_rgb8();
        let img = image::imageops::resize(&img, w as u32, h as u32, FilterType::Triangle);
        let data = Array3::from_shape_fn((3, h, w), |(c, y, x)| {
            img.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
        });
        Ok(Self { data })
    }

    /// Project every pixel back onto [0, 1]. Called after each optimizer step.
    pub fn clamp_unit(&mut self) {
        self.data.mapv_inplace(|v| v.clamp(0.0, 1.0));
    }

    pub fn height(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn width(&self) -> usize {
        self.data.shape()[2]
    }

    /// Render the patch to an 8-bit RGB image.
    pub fn to_image(&self) -> RgbImage {
        let (h, w) = (self.height(), self.width());
        RgbImage::from_fn(w as u32, h as u32, |x, y| {
            let px = |c: usize| {
                (self.data[[c, y as usize, x as usize]].clamp(0.0, 1.0) * 255.0).round() as u8
            };
            Rgb([px(0), px(1), px(2)])
        })
    }

    /// Persist the patch as an image artifact.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.to_image()
            .save(path)
            .with_context(|| format!("writing patch image {}", path.display()))
    }

    /// True if every pixel is finite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

/// Render an arbitrary 3×H×W tensor in [0, 1] to an 8-bit image.
/// Used for debug composite dumps.
pub fn tensor_to_image(t: &ndarray::ArrayView3<f32>) -> RgbImage {
    let (h, w) = (t.shape()[1], t.shape()[2]);
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let px = |c: usize| (t[[c, y as usize, x as usize]].clamp(0.0, 1.0) * 255.0).round() as u8;
        Rgb([px(0), px(1), px(2)])
    })
}
