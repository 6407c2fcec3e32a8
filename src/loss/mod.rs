//! Loss terms shaping the patch.
//!
//! Each module exposes a scalar forward pass plus an analytic gradient:
//! confidence extraction reads the detector output, while printability,
//! smoothness and saliency read the patch directly. The training loop sums
//! the weighted terms into one scalar and accumulates their gradients into
//! a single patch gradient.

pub mod extractor;
pub mod nps;
pub mod saliency;
pub mod tv;

pub use extractor::MaxProbExtractor;
pub use nps::NpsLoss;
pub use saliency::SaliencyLoss;
pub use tv::TotalVariationLoss;
