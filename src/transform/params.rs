//! Per-instance transform parameter sampling.
//!
//! For every label slot in a batch the sampler draws one `InstanceTransform`:
//! photometric jitter (contrast, brightness, noise seed), a rotation angle,
//! the patch scale derived from the box area, and the placement centre.
//! Sampling is driven by a single seeded RNG so a run is reproducible from
//! its seed, and the warp stage is a pure function of these parameters.

use ndarray::ArrayView3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Contrast jitter range.
pub const MIN_CONTRAST: f32 = 0.8;
pub const MAX_CONTRAST: f32 = 1.2;

/// Additive brightness jitter range (symmetric).
pub const MAX_BRIGHTNESS: f32 = 0.1;

/// Amplitude of per-pixel uniform noise.
pub const NOISE_FACTOR: f32 = 0.1;

/// Rotation jitter range in degrees (symmetric).
pub const MAX_ROTATION_DEG: f32 = 20.0;

/// Static transformer configuration.
#[derive(Clone, Debug)]
pub struct TransformConfig {
    /// Patch side as a fraction of sqrt(box area in pixels).
    pub target_size_frac: f32,

    /// Enable contrast/brightness/noise jitter.
    pub jitter: bool,

    /// Enable random rotation.
    pub rotate: bool,

    /// Place at a random offset inside the box instead of its centre.
    pub rand_loc: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            target_size_frac: 0.3,
            jitter: true,
            rotate: true,
            rand_loc: false,
        }
    }
}

/// Sampled transform parameters for one label slot.
#[derive(Clone, Copy, Debug)]
pub struct InstanceTransform {
    /// False for padded or malformed label slots; such slots produce an
    /// all-zero instance and carry no gradient.
    pub valid: bool,

    /// Multiplicative contrast factor.
    pub contrast: f32,

    /// Additive brightness offset.
    pub brightness: f32,

    /// Seed for the per-pixel uniform noise field.
    pub noise_seed: u64,

    /// Noise amplitude (0 disables the noise field).
    pub noise_amp: f32,

    /// Rotation angle in radians.
    pub angle: f32,

    /// Patch-to-canvas scale factor.
    pub scale: f32,

    /// Placement centre on the canvas, in pixel-centre coordinates.
    pub cx: f32,
    pub cy: f32,
}

impl InstanceTransform {
    /// The invalid marker: everything zeroed.
    pub fn invalid() -> Self {
        Self {
            valid: false,
            contrast: 1.0,
            brightness: 0.0,
            noise_seed: 0,
            noise_amp: 0.0,
            angle: 0.0,
            scale: 1.0,
            cx: 0.0,
            cy: 0.0,
        }
    }
}

/// Draws per-instance transform parameters from one seeded RNG.
pub struct TransformSampler {
    rng: StdRng,
}

impl TransformSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sample one `InstanceTransform` per label slot.
    ///
    /// `labels` is (batch, max_labels, 5) with rows `[class, cx, cy, w, h]`
    /// in normalized image coordinates; all-zero rows are padding. A box
    /// with non-positive width or height is treated as invalid rather than
    /// propagated into the warp.
    pub fn sample(
        &mut self,
        labels: &ArrayView3<f32>,
        patch_hw: (usize, usize),
        canvas_hw: (usize, usize),
        cfg: &TransformConfig,
    ) -> Vec<Vec<InstanceTransform>> {
        let (n, m) = (labels.shape()[0], labels.shape()[1]);
        let patch_side = ((patch_hw.0 * patch_hw.1) as f32).sqrt();
        let (canvas_h, canvas_w) = (canvas_hw.0 as f32, canvas_hw.1 as f32);

        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let mut row = Vec::with_capacity(m);
            for j in 0..m {
                let cls = labels[[i, j, 0]];
                let bx = labels[[i, j, 1]];
                let by = labels[[i, j, 2]];
                let bw = labels[[i, j, 3]];
                let bh = labels[[i, j, 4]];

                // Padding rows are all-zero; malformed boxes are skipped too.
                let padded = cls == 0.0 && bx == 0.0 && by == 0.0 && bw == 0.0 && bh == 0.0;
                if padded || bw <= 0.0 || bh <= 0.0 {
                    row.push(InstanceTransform::invalid());
                    continue;
                }

                let (contrast, brightness, noise_seed, noise_amp) = if cfg.jitter {
                    (
                        self.rng.gen_range(MIN_CONTRAST..MAX_CONTRAST),
                        self.rng.gen_range(-MAX_BRIGHTNESS..MAX_BRIGHTNESS),
                        self.rng.gen::<u64>(),
                        NOISE_FACTOR,
                    )
                } else {
                    (1.0, 0.0, 0, 0.0)
                };

                let angle = if cfg.rotate {
                    let max = MAX_ROTATION_DEG.to_radians();
                    self.rng.gen_range(-max..max)
                } else {
                    0.0
                };

                // Patch side tracks object size: frac * sqrt(box pixel area).
                let box_w_px = bw * canvas_w;
                let box_h_px = bh * canvas_h;
                let target_side = cfg.target_size_frac * (box_w_px * box_h_px).sqrt();
                let scale = target_side / patch_side;

                let (mut cx, mut cy) = (bx * canvas_w - 0.5, by * canvas_h - 0.5);
                if cfg.rand_loc {
                    // Random offset within the box, keeping the patch centre
                    // inside the box footprint.
                    let off_x = self.rng.gen_range(-0.5f32..0.5) * (box_w_px - target_side).max(0.0);
                    let off_y = self.rng.gen_range(-0.5f32..0.5) * (box_h_px - target_side).max(0.0);
                    cx += off_x;
                    cy += off_y;
                }

                row.push(InstanceTransform {
                    valid: true,
                    contrast,
                    brightness,
                    noise_seed,
                    noise_amp,
                    angle,
                    scale,
                    cx,
                    cy,
                });
            }
            out.push(row);
        }
        out
    }
}
