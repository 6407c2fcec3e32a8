//! Batched patch warp: photometric jitter, rotation, scaling, placement.
//!
//! Forward maps the single patch into one canvas-sized instance per label
//! slot. Every canvas pixel inside the footprint is inverse-mapped through
//! translate⁻¹ ∘ rotate⁻¹ ∘ scale⁻¹ and bilinearly sampled from the
//! jittered patch; everything outside the footprint stays exactly zero.
//!
//! The backward pass is the transpose of the same linear map: the bilinear
//! weights scatter the upstream gradient back onto patch pixels, scaled by
//! the contrast factor, with gradient zeroed where the photometric clamp
//! saturated.

use ndarray::{Array3, Array5, ArrayView3, ArrayView5};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::params::InstanceTransform;

/// Post-jitter clamp bounds. Keeping the floor strictly positive also keeps
/// footprint pixels distinguishable from the zero background.
pub const CLAMP_MIN: f32 = 1e-6;
pub const CLAMP_MAX: f32 = 0.999_999;

/// What the backward pass needs from one forward pass.
pub struct TransformRecord {
    /// Per-slot parameters, (batch, max_labels).
    params: Vec<Vec<InstanceTransform>>,

    /// Jittered patch per valid slot, indexed like `params`.
    jittered: Vec<Vec<Option<Array3<f32>>>>,

    patch_hw: (usize, usize),
    canvas_hw: (usize, usize),
}

/// Maps a patch plus sampled per-instance parameters to a batch of
/// canvas-aligned patch instances.
pub struct PatchTransformer;

impl PatchTransformer {
    pub fn new() -> Self {
        Self
    }

    /// Produce the transformed instance batch, shape
    /// (batch, max_labels, 3, canvas_h, canvas_w), plus the backward record.
    pub fn forward(
        &self,
        patch: &ArrayView3<f32>,
        params: &[Vec<InstanceTransform>],
        canvas_hw: (usize, usize),
    ) -> (Array5<f32>, TransformRecord) {
        let (ph, pw) = (patch.shape()[1], patch.shape()[2]);
        let (ch, cw) = canvas_hw;
        let n = params.len();
        let m = params.first().map_or(0, Vec::len);

        let mut out = Array5::zeros((n, m, 3, ch, cw));
        let mut jittered = Vec::with_capacity(n);

        for (i, row) in params.iter().enumerate() {
            let mut jit_row = Vec::with_capacity(m);
            for (j, t) in row.iter().enumerate() {
                if !t.valid {
                    jit_row.push(None);
                    continue;
                }
                let q = jitter_patch(patch, t);
                for_each_footprint_pixel(t, (ph, pw), canvas_hw, &mut |v, u, lerp| {
                    for c in 0..3 {
                        let value = lerp.sample(&q.view(), c);
                        out[[i, j, c, v, u]] = value;
                    }
                });
                jit_row.push(Some(q));
            }
            jittered.push(jit_row);
        }

        let record = TransformRecord {
            params: params.to_vec(),
            jittered,
            patch_hw: (ph, pw),
            canvas_hw,
        };
        (out, record)
    }

    /// Accumulate the gradient of all instances back onto the patch.
    pub fn backward(&self, record: &TransformRecord, grad_out: &ArrayView5<f32>) -> Array3<f32> {
        let (ph, pw) = record.patch_hw;
        let mut grad_patch = Array3::zeros((3, ph, pw));

        for (i, row) in record.params.iter().enumerate() {
            for (j, t) in row.iter().enumerate() {
                if !t.valid {
                    continue;
                }
                let q = record.jittered[i][j]
                    .as_ref()
                    .expect("valid slot always has a jittered patch");

                // Transpose scatter: same bilinear weights, accumulated from
                // the upstream gradient instead of read from the patch.
                let mut grad_q = Array3::zeros((3, ph, pw));
                for_each_footprint_pixel(t, (ph, pw), record.canvas_hw, &mut |v, u, lerp| {
                    for c in 0..3 {
                        let g = grad_out[[i, j, c, v, u]];
                        if g != 0.0 {
                            lerp.scatter(&mut grad_q, c, g);
                        }
                    }
                });

                // Chain through the photometric stage: dq/dp = contrast,
                // zeroed where the clamp saturated.
                for c in 0..3 {
                    for y in 0..ph {
                        for x in 0..pw {
                            let qv = q[[c, y, x]];
                            if qv > CLAMP_MIN && qv < CLAMP_MAX {
                                grad_patch[[c, y, x]] += t.contrast * grad_q[[c, y, x]];
                            }
                        }
                    }
                }
            }
        }
        grad_patch
    }
}

impl Default for PatchTransformer {
    fn default() -> Self {
        Self::new()
    }
}

/// One bilinear sampling cell: origin pixel plus fractional weights.
struct Bilinear {
    py0: usize,
    px0: usize,
    py1: usize,
    px1: usize,
    wy: f32,
    wx: f32,
}

impl Bilinear {
    fn sample(&self, q: &ArrayView3<f32>, c: usize) -> f32 {
        q[[c, self.py0, self.px0]] * (1.0 - self.wy) * (1.0 - self.wx)
            + q[[c, self.py0, self.px1]] * (1.0 - self.wy) * self.wx
            + q[[c, self.py1, self.px0]] * self.wy * (1.0 - self.wx)
            + q[[c, self.py1, self.px1]] * self.wy * self.wx
    }

    fn scatter(&self, grad_q: &mut Array3<f32>, c: usize, g: f32) {
        grad_q[[c, self.py0, self.px0]] += g * (1.0 - self.wy) * (1.0 - self.wx);
        grad_q[[c, self.py0, self.px1]] += g * (1.0 - self.wy) * self.wx;
        grad_q[[c, self.py1, self.px0]] += g * self.wy * (1.0 - self.wx);
        grad_q[[c, self.py1, self.px1]] += g * self.wy * self.wx;
    }
}

/// Apply contrast, brightness and seeded per-pixel noise, then clamp.
fn jitter_patch(patch: &ArrayView3<f32>, t: &InstanceTransform) -> Array3<f32> {
    let (ph, pw) = (patch.shape()[1], patch.shape()[2]);
    let mut q = Array3::zeros((3, ph, pw));
    let mut rng = StdRng::seed_from_u64(t.noise_seed);
    for c in 0..3 {
        for y in 0..ph {
            for x in 0..pw {
                let noise = if t.noise_amp > 0.0 {
                    rng.gen_range(-1.0f32..1.0) * t.noise_amp
                } else {
                    0.0
                };
                let v = t.contrast * patch[[c, y, x]] + t.brightness + noise;
                q[[c, y, x]] = v.clamp(CLAMP_MIN, CLAMP_MAX);
            }
        }
    }
    q
}

/// Iterate the canvas pixels whose inverse image lands inside the patch.
///
/// For each such pixel (v, u) the callback receives the bilinear cell.
/// Shared by forward sampling and backward scatter so the two are exact
/// transposes of each other.
fn for_each_footprint_pixel(
    t: &InstanceTransform,
    patch_hw: (usize, usize),
    canvas_hw: (usize, usize),
    visit: &mut dyn FnMut(usize, usize, &Bilinear),
) {
    let (ph, pw) = patch_hw;
    let (ch, cw) = canvas_hw;
    if ch == 0 || cw == 0 || t.scale <= 0.0 {
        return;
    }

    let half_w = (pw - 1) as f32 / 2.0;
    let half_h = (ph - 1) as f32 / 2.0;
    let (sin, cos) = t.angle.sin_cos();

    // Conservative footprint bound: scaled half-diagonal plus one pixel.
    let radius = t.scale * (half_w * half_w + half_h * half_h).sqrt() + 1.0;
    let u_lo = (t.cx - radius).floor().max(0.0) as usize;
    let v_lo = (t.cy - radius).floor().max(0.0) as usize;
    let u_hi = (t.cx + radius).ceil().min(cw as f32 - 1.0);
    let v_hi = (t.cy + radius).ceil().min(ch as f32 - 1.0);
    if u_hi < 0.0 || v_hi < 0.0 {
        return;
    }
    let (u_hi, v_hi) = (u_hi as usize, v_hi as usize);

    for v in v_lo..=v_hi {
        for u in u_lo..=u_hi {
            let dx = u as f32 - t.cx;
            let dy = v as f32 - t.cy;
            // Inverse rotation then inverse scale, into patch coordinates.
            let px = (cos * dx + sin * dy) / t.scale + half_w;
            let py = (-sin * dx + cos * dy) / t.scale + half_h;
            if px < 0.0 || px > (pw - 1) as f32 || py < 0.0 || py > (ph - 1) as f32 {
                continue;
            }
            let px0 = px.floor() as usize;
            let py0 = py.floor() as usize;
            let cell = Bilinear {
                py0,
                px0,
                py1: (py0 + 1).min(ph - 1),
                px1: (px0 + 1).min(pw - 1),
                wy: py - py0 as f32,
                wx: px - px0 as f32,
            };
            visit(v, u, &cell);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::params::{TransformConfig, TransformSampler};
    use ndarray::{Array3, Array5};

    fn ramp_patch(h: usize, w: usize) -> Array3<f32> {
        // Mid-range values so the photometric clamp never saturates.
        Array3::from_shape_fn((3, h, w), |(c, y, x)| {
            0.2 + 0.6 * ((c * h * w + y * w + x) as f32) / ((3 * h * w) as f32)
        })
    }

    fn centred_identity(cx: f32, cy: f32) -> InstanceTransform {
        InstanceTransform {
            valid: true,
            contrast: 1.0,
            brightness: 0.0,
            noise_seed: 0,
            noise_amp: 0.0,
            angle: 0.0,
            scale: 1.0,
            cx,
            cy,
        }
    }

    #[test]
    fn test_identity_placement_reproduces_patch() {
        // 5x5 patch centred at pixel (5, 5) of an 11x11 canvas: the inverse
        // map hits patch pixel centres exactly.
        let patch = ramp_patch(5, 5);
        let params = vec![vec![centred_identity(5.0, 5.0)]];
        let tf = PatchTransformer::new();
        let (out, _) = tf.forward(&patch.view(), &params, (11, 11));

        for c in 0..3 {
            for y in 0..5 {
                for x in 0..5 {
                    let got = out[[0, 0, c, y + 3, x + 3]];
                    let want = patch[[c, y, x]];
                    assert!((got - want).abs() < 1e-4, "({c},{y},{x}): {got} vs {want}");
                }
            }
        }
    }

    #[test]
    fn test_outside_footprint_is_exactly_zero() {
        let patch = ramp_patch(5, 5);
        let params = vec![vec![centred_identity(5.0, 5.0)]];
        let (out, _) = PatchTransformer::new().forward(&patch.view(), &params, (11, 11));

        // Corners of the canvas are well outside the 5x5 footprint.
        for c in 0..3 {
            assert_eq!(out[[0, 0, c, 0, 0]], 0.0);
            assert_eq!(out[[0, 0, c, 10, 10]], 0.0);
            assert_eq!(out[[0, 0, c, 0, 10]], 0.0);
        }
    }

    #[test]
    fn test_invalid_slot_yields_zero_instance() {
        let patch = ramp_patch(5, 5);
        let params = vec![vec![InstanceTransform::invalid(), centred_identity(5.0, 5.0)]];
        let (out, _) = PatchTransformer::new().forward(&patch.view(), &params, (11, 11));
        assert!(out
            .index_axis(ndarray::Axis(0), 0)
            .index_axis(ndarray::Axis(0), 0)
            .iter()
            .all(|&v| v == 0.0));
        assert!(out
            .index_axis(ndarray::Axis(0), 0)
            .index_axis(ndarray::Axis(0), 1)
            .iter()
            .any(|&v| v != 0.0));
    }

    #[test]
    fn test_rotation_keeps_corners_empty() {
        // A 45 degree rotation of a square patch leaves the canvas pixels at
        // the unrotated corner positions empty (alpha-zero corners).
        let patch = Array3::from_elem((3, 9, 9), 0.5);
        let mut t = centred_identity(10.0, 10.0);
        t.angle = std::f32::consts::FRAC_PI_4;
        let (out, _) = PatchTransformer::new().forward(&patch.view(), &[vec![t]], (21, 21));
        // Unrotated footprint corner (6, 6) lies outside the rotated square.
        assert_eq!(out[[0, 0, 0, 6, 6]], 0.0);
        // The centre is still covered.
        assert!(out[[0, 0, 0, 10, 10]] > 0.0);
    }

    #[test]
    fn test_forward_backward_adjoint_identity() {
        // Without jitter the warp is linear in the patch, so
        // <F(p), g> == <p, F^T(g)> must hold to float precision.
        let patch = ramp_patch(6, 6);
        let mut t = centred_identity(7.3, 6.8);
        t.angle = 0.4;
        t.scale = 1.7;
        let params = vec![vec![t]];
        let tf = PatchTransformer::new();
        let (out, rec) = tf.forward(&patch.view(), &params, (16, 16));

        let g = Array5::from_shape_fn(out.raw_dim(), |(_, _, c, v, u)| {
            ((c + 2 * v + 3 * u) as f32 * 0.37).sin()
        });
        let grad = tf.backward(&rec, &g.view());

        let lhs: f32 = out.iter().zip(g.iter()).map(|(a, b)| a * b).sum();
        let rhs: f32 = patch.iter().zip(grad.iter()).map(|(a, b)| a * b).sum();
        assert!(
            (lhs - rhs).abs() < 1e-3 * lhs.abs().max(1.0),
            "lhs={lhs} rhs={rhs}"
        );
    }

    #[test]
    fn test_backward_matches_directional_finite_difference() {
        // Values chosen so no jitter draw can reach the clamp bounds:
        // worst cases 0.3*0.8 - 0.2 > 0 and 0.62*1.2 + 0.2 < 1.
        let patch = Array3::from_shape_fn((3, 5, 5), |(c, y, x)| {
            0.3 + 0.32 * ((c * 25 + y * 5 + x) as f32) / 75.0
        });
        let labels = {
            let mut l = Array3::zeros((1, 2, 5));
            l[[0, 0, 0]] = 1.0;
            l[[0, 0, 1]] = 0.5;
            l[[0, 0, 2]] = 0.5;
            l[[0, 0, 3]] = 0.6;
            l[[0, 0, 4]] = 0.6;
            l
        };
        let cfg = TransformConfig {
            jitter: true,
            rotate: true,
            target_size_frac: 0.5,
            rand_loc: false,
        };
        // Fixed sampled parameters shared by all evaluations.
        let params = TransformSampler::new(11).sample(&labels.view(), (5, 5), (20, 20), &cfg);

        let tf = PatchTransformer::new();
        let g = Array5::from_shape_fn((1, 2, 3, 20, 20), |(_, _, c, v, u)| {
            ((c + v + u) as f32 * 0.11).cos()
        });
        let loss = |p: &Array3<f32>| -> f32 {
            let (out, _) = tf.forward(&p.view(), &params, (20, 20));
            out.iter().zip(g.iter()).map(|(a, b)| a * b).sum()
        };

        let (_, rec) = tf.forward(&patch.view(), &params, (20, 20));
        let grad = tf.backward(&rec, &g.view());

        let dir = Array3::from_shape_fn((3, 5, 5), |(c, y, x)| ((c + y * x) as f32 * 0.7).sin());
        let eps = 1e-3;
        let mut plus = patch.clone();
        plus.scaled_add(eps, &dir);
        let mut minus = patch.clone();
        minus.scaled_add(-eps, &dir);
        let fd = (loss(&plus) - loss(&minus)) / (2.0 * eps);
        let analytic: f32 = grad.iter().zip(dir.iter()).map(|(a, b)| a * b).sum();
        assert!(
            (fd - analytic).abs() < 2e-2 * analytic.abs().max(1.0),
            "fd={fd} analytic={analytic}"
        );
    }

    #[test]
    fn test_clamped_pixels_carry_no_gradient() {
        // Brightness pushes every pixel past the clamp ceiling, so the
        // backward pass must return an all-zero gradient.
        let patch = Array3::from_elem((3, 4, 4), 0.9);
        let mut t = centred_identity(5.0, 5.0);
        t.brightness = 0.5;
        let tf = PatchTransformer::new();
        let (_, rec) = tf.forward(&patch.view(), &[vec![t]], (11, 11));
        let g = Array5::from_elem((1, 1, 3, 11, 11), 1.0);
        let grad = tf.backward(&rec, &g.view());
        assert!(grad.iter().all(|&v| v == 0.0));
    }
}
