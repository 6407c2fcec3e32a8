//! Geometric and photometric patch transformation.
//!
//! Randomness and transform application are separable stages: `params`
//! samples per-instance transform parameters once per batch, `transformer`
//! applies them as a deterministic batched warp, `applier` composites the
//! warped instances onto images. Each stage carries an analytic
//! vector-Jacobian product so gradient flows back to the patch parameter.

pub mod applier;
pub mod params;
pub mod transformer;

pub use applier::PatchApplier;
pub use params::{InstanceTransform, TransformConfig, TransformSampler};
pub use transformer::PatchTransformer;
