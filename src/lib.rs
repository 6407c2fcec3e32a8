//! # advpatch
//!
//! Adversarial patch optimization against frozen object detectors.
//!
//! A small image patch is optimized by gradient descent so that placing it
//! over objects suppresses a detector's confidence. The crate covers the
//! full optimization engine:
//!
//! 1. **Patch** — the single trainable tensor, projected onto [0, 1] after
//!    every update
//! 2. **Transform** — per-object photometric jitter plus a rotate/scale/
//!    translate warp aligning patch instances to labelled boxes
//! 3. **Applier** — sequential alpha compositing onto the image batch
//! 4. **Detector boundary** — an opaque frozen scoring function that
//!    supplies the gradient of its scores with respect to its input
//! 5. **Losses** — max-confidence extraction, printability (NPS), total
//!    variation, optional colourfulness saliency
//! 6. **Loop** — Adam with AMSGrad, reduce-on-plateau learning rate,
//!    bounded-prefetch data loading, per-epoch patch checkpoints
//!
//! There is no autograd runtime: every stage pairs its forward pass with an
//! analytic vector-Jacobian product, and the training loop chains them back
//! into a single patch gradient.

pub mod config;
pub mod data;
pub mod detect;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod patch;
pub mod train;
pub mod transform;
