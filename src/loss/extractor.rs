//! Confidence extraction from detector output.
//!
//! Per image: combine every candidate's objectness and target-class score
//! under the configured rule, take the maximum over candidates. The max
//! approximates the best the detector can still do against the image, which
//! is exactly what the attack must drive down. The batch mean is taken by
//! the caller.
//!
//! Backward routes gradient to the argmax candidate only, with the rule's
//! partial derivatives.

use ndarray::{Array1, Array2, Array3};

use crate::config::LossTarget;
use crate::detect::DetectorOutput;

/// Per-image argmax bookkeeping for the backward pass.
pub struct ExtractorRecord {
    /// (candidate index, objectness, class score) per image; `None` when the
    /// detector produced no candidates.
    winners: Vec<Option<(usize, f32, f32)>>,

    candidates: usize,
    classes: usize,
    class_id: usize,
}

/// Extracts the per-image maximum combined confidence.
pub struct MaxProbExtractor {
    target: LossTarget,
    class_id: usize,
}

impl MaxProbExtractor {
    pub fn new(target: LossTarget, class_id: usize) -> Self {
        Self { target, class_id }
    }

    /// Per-image maximum combined confidence, plus the backward record.
    pub fn extract(&self, output: &DetectorOutput) -> (Array1<f32>, ExtractorRecord) {
        let n = output.batch_size();
        let d = output.num_candidates();
        let k = output.num_classes();

        let mut max_probs = Array1::zeros(n);
        let mut winners = Vec::with_capacity(n);

        for i in 0..n {
            let mut best: Option<(usize, f32, f32, f32)> = None;
            for j in 0..d {
                let obj = output.objectness[[i, j]];
                let cls = output.class_scores[[i, j, self.class_id]];
                let combined = self.target.combine(obj, cls);
                if best.map_or(true, |(_, _, _, b)| combined > b) {
                    best = Some((j, obj, cls, combined));
                }
            }
            match best {
                Some((j, obj, cls, combined)) => {
                    max_probs[i] = combined;
                    winners.push(Some((j, obj, cls)));
                }
                None => winners.push(None),
            }
        }

        (
            max_probs,
            ExtractorRecord {
                winners,
                candidates: d,
                classes: k,
                class_id: self.class_id,
            },
        )
    }

    /// Map per-image upstream gradients onto the detector's score arrays.
    pub fn backward(
        &self,
        record: &ExtractorRecord,
        grad_per_image: &Array1<f32>,
    ) -> (Array2<f32>, Array3<f32>) {
        let n = record.winners.len();
        let mut grad_obj = Array2::zeros((n, record.candidates));
        let mut grad_cls = Array3::zeros((n, record.candidates, record.classes));

        for (i, winner) in record.winners.iter().enumerate() {
            if let Some((j, obj, cls)) = *winner {
                let (dobj, dcls) = self.target.grads(obj, cls);
                grad_obj[[i, j]] = grad_per_image[i] * dobj;
                grad_cls[[i, j, record.class_id]] = grad_per_image[i] * dcls;
            }
        }
        (grad_obj, grad_cls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn output_from(obj: Vec<Vec<f32>>, cls: Vec<Vec<Vec<f32>>>) -> DetectorOutput {
        let n = obj.len();
        let d = obj[0].len();
        let k = cls[0][0].len();
        DetectorOutput {
            objectness: Array2::from_shape_fn((n, d), |(i, j)| obj[i][j]),
            class_scores: Array3::from_shape_fn((n, d, k), |(i, j, c)| cls[i][j][c]),
        }
    }

    #[test]
    fn test_single_detection_product_rule() {
        // The wiring scenario: one detection with obj=0.9, cls=0.8 for the
        // target class; under "obj * cls" the extracted confidence is 0.72.
        let out = output_from(vec![vec![0.9]], vec![vec![vec![0.8, 0.1]]]);
        let ex = MaxProbExtractor::new(LossTarget::ObjectnessClass, 0);
        let (probs, _) = ex.extract(&out);
        assert!((probs[0] - 0.72).abs() < 1e-6);
    }

    #[test]
    fn test_each_rule_selects_correctly() {
        // Candidate 0: obj 0.9, cls 0.2 -> product 0.18
        // Candidate 1: obj 0.5, cls 0.8 -> product 0.40
        let out = output_from(
            vec![vec![0.9, 0.5]],
            vec![vec![vec![0.2], vec![0.8]]],
        );

        let (p, _) = MaxProbExtractor::new(LossTarget::Objectness, 0).extract(&out);
        assert!((p[0] - 0.9).abs() < 1e-6);

        let (p, _) = MaxProbExtractor::new(LossTarget::ClassScore, 0).extract(&out);
        assert!((p[0] - 0.8).abs() < 1e-6);

        let (p, _) = MaxProbExtractor::new(LossTarget::ObjectnessClass, 0).extract(&out);
        assert!((p[0] - 0.40).abs() < 1e-6);
    }

    #[test]
    fn test_mean_over_batch_of_maxima() {
        let out = output_from(
            vec![vec![0.9, 0.1], vec![0.3, 0.6]],
            vec![
                vec![vec![0.8], vec![0.9]],
                vec![vec![0.5], vec![0.5]],
            ],
        );
        let ex = MaxProbExtractor::new(LossTarget::ObjectnessClass, 0);
        let (p, _) = ex.extract(&out);
        // Image 0: max(0.72, 0.09) = 0.72; image 1: max(0.15, 0.30) = 0.30.
        let mean = p.iter().sum::<f32>() / 2.0;
        assert!((mean - 0.51).abs() < 1e-6);
    }

    #[test]
    fn test_backward_routes_to_argmax_only() {
        let out = output_from(
            vec![vec![0.9, 0.5]],
            vec![vec![vec![0.2, 0.0], vec![0.8, 0.0]]],
        );
        let ex = MaxProbExtractor::new(LossTarget::ObjectnessClass, 0);
        let (_, rec) = ex.extract(&out);
        let grad_in = Array1::from_vec(vec![1.0]);
        let (gobj, gcls) = ex.backward(&rec, &grad_in);

        // Winner is candidate 1 (0.40); d/dobj = cls = 0.8, d/dcls = obj = 0.5.
        assert_eq!(gobj[[0, 0]], 0.0);
        assert!((gobj[[0, 1]] - 0.8).abs() < 1e-6);
        assert!((gcls[[0, 1, 0]] - 0.5).abs() < 1e-6);
        assert_eq!(gcls[[0, 0, 0]], 0.0);
        assert_eq!(gcls[[0, 1, 1]], 0.0);
    }

    #[test]
    fn test_no_candidates_is_zero_loss_and_gradient() {
        let out = DetectorOutput {
            objectness: Array2::zeros((2, 0)),
            class_scores: Array3::zeros((2, 0, 3)),
        };
        let ex = MaxProbExtractor::new(LossTarget::Objectness, 0);
        let (p, rec) = ex.extract(&out);
        assert!(p.iter().all(|&v| v == 0.0));
        let (gobj, gcls) = ex.backward(&rec, &Array1::from_vec(vec![0.5, 0.5]));
        assert_eq!(gobj.shape(), &[2, 0]);
        assert_eq!(gcls.shape(), &[2, 0, 3]);
    }
}
