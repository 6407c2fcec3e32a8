//! The frozen-detector boundary.
//!
//! The optimization engine treats the detector as an opaque scoring
//! function: it consumes a composited image batch and returns, per image,
//! an ordered set of candidate detections with objectness and class scores.
//! Because the patch is optimized by gradient descent, a detector must also
//! supply the gradient of its scores with respect to its input pixels; the
//! `DetectorPass` returned by `forward` carries that as a tape. The
//! detector's own parameters are owned by the implementation and never
//! touched here — frozen by construction.

pub mod reference;

use ndarray::{Array2, Array3, Array4, ArrayView4};

pub use reference::PoolingDetector;

/// Raw detector scores for one image batch.
///
/// `objectness` is (batch, candidates) in [0, 1]; `class_scores` is
/// (batch, candidates, classes) in [0, 1]. Candidate order is stable for a
/// given input.
#[derive(Clone, Debug)]
pub struct DetectorOutput {
    pub objectness: Array2<f32>,
    pub class_scores: Array3<f32>,
}

impl DetectorOutput {
    pub fn batch_size(&self) -> usize {
        self.objectness.shape()[0]
    }

    pub fn num_candidates(&self) -> usize {
        self.objectness.shape()[1]
    }

    pub fn num_classes(&self) -> usize {
        self.class_scores.shape()[2]
    }
}

/// Backward closure over one forward pass: maps upstream gradients on the
/// scores to a gradient on the input images.
pub trait DetectorTape {
    fn vjp(&self, grad_obj: &Array2<f32>, grad_cls: &Array3<f32>) -> Array4<f32>;
}

/// One scored forward pass plus its backward tape.
pub struct DetectorPass {
    pub output: DetectorOutput,
    pub tape: Box<dyn DetectorTape>,
}

/// A frozen object detector.
pub trait Detector {
    /// Score a batch of images, shape (batch, 3, H, W), values in [0, 1].
    fn forward(&self, images: &ArrayView4<f32>) -> anyhow::Result<DetectorPass>;

    /// Width of the class-score vector.
    fn num_classes(&self) -> usize;
}

/// Returns canned scores regardless of input; gradient-free.
///
/// Used to validate extractor wiring independent of the transform path.
pub struct FixedDetector {
    pub output: DetectorOutput,
}

struct ZeroTape {
    shape: (usize, usize, usize, usize),
}

impl DetectorTape for ZeroTape {
    fn vjp(&self, _grad_obj: &Array2<f32>, _grad_cls: &Array3<f32>) -> Array4<f32> {
        Array4::zeros(self.shape)
    }
}

impl Detector for FixedDetector {
    fn forward(&self, images: &ArrayView4<f32>) -> anyhow::Result<DetectorPass> {
        let s = images.shape();
        Ok(DetectorPass {
            output: self.output.clone(),
            tape: Box::new(ZeroTape {
                shape: (s[0], s[1], s[2], s[3]),
            }),
        })
    }

    fn num_classes(&self) -> usize {
        self.output.num_classes()
    }
}
