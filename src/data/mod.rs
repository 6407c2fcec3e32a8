//! Batches, batch sources and prefetching.
//!
//! `ImageBatch` is (batch, 3, H, W) in [0, 1]; `LabelBatch` is
//! (batch, max_labels, 5) with rows `[class, cx, cy, w, h]` in normalized
//! coordinates and all-zero padding rows. A `BatchSource` is a pure
//! function of (epoch, batch index), which makes batch order a function of
//! the shuffle seed alone — the prefetch thread cannot perturb it.

pub mod prefetch;
pub mod yolo;

use ndarray::{Array2, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

pub use prefetch::PrefetchLoader;
pub use yolo::YoloDirSource;

/// (batch, 3, H, W), values in the detector's input range.
pub type ImageBatch = Array4<f32>;

/// (batch, max_labels, 5): `[class, cx, cy, w, h]`, zero rows are padding.
pub type LabelBatch = Array3<f32>;

/// Fields per label row.
pub const LABEL_FIELDS: usize = 5;

/// Yields (image, label) batches for training.
pub trait BatchSource: Send + Sync {
    /// Batches per epoch.
    fn num_batches(&self) -> usize;

    /// Assemble one batch. Must be deterministic in (epoch, index).
    fn batch(&self, epoch: usize, index: usize) -> anyhow::Result<(ImageBatch, LabelBatch)>;
}

/// Samples held in memory; batch order reshuffled per epoch from the seed.
pub struct InMemorySource {
    /// One (3, H, W) image per sample.
    images: Vec<Array3<f32>>,

    /// One (max_labels, 5) padded label table per sample.
    labels: Vec<Array2<f32>>,

    batch_size: usize,
    shuffle_seed: Option<u64>,
}

impl InMemorySource {
    pub fn new(
        images: Vec<Array3<f32>>,
        labels: Vec<Array2<f32>>,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Self {
        assert_eq!(images.len(), labels.len());
        assert!(batch_size > 0);
        Self {
            images,
            labels,
            batch_size,
            shuffle_seed,
        }
    }

    /// Sample order for an epoch: identity, or a seeded permutation.
    fn order(&self, epoch: usize) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.images.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            idx.shuffle(&mut rng);
        }
        idx
    }
}

impl BatchSource for InMemorySource {
    fn num_batches(&self) -> usize {
        self.images.len() / self.batch_size
    }

    fn batch(&self, epoch: usize, index: usize) -> anyhow::Result<(ImageBatch, LabelBatch)> {
        let order = self.order(epoch);
        let start = index * self.batch_size;
        anyhow::ensure!(
            start + self.batch_size <= order.len(),
            "batch index {index} out of range"
        );

        let first = &self.images[order[start]];
        let (h, w) = (first.shape()[1], first.shape()[2]);
        let max_labels = self.labels[order[start]].nrows();

        let mut images = Array4::zeros((self.batch_size, 3, h, w));
        let mut labels = Array3::zeros((self.batch_size, max_labels, LABEL_FIELDS));
        for b in 0..self.batch_size {
            let s = order[start + b];
            images
                .index_axis_mut(Axis(0), b)
                .assign(&self.images[s]);
            labels
                .index_axis_mut(Axis(0), b)
                .assign(&self.labels[s]);
        }
        Ok((images, labels))
    }
}

/// Pad a list of label rows to a fixed-capacity table; excess rows are
/// dropped, missing rows stay zero.
pub fn pad_labels(rows: &[[f32; LABEL_FIELDS]], max_labels: usize) -> Array2<f32> {
    let mut table = Array2::zeros((max_labels, LABEL_FIELDS));
    for (j, row) in rows.iter().take(max_labels).enumerate() {
        for (k, v) in row.iter().enumerate() {
            table[[j, k]] = *v;
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source(n: usize, shuffle: Option<u64>) -> InMemorySource {
        let images: Vec<Array3<f32>> = (0..n)
            .map(|i| Array3::from_elem((3, 4, 4), i as f32 / n as f32))
            .collect();
        let labels: Vec<Array2<f32>> = (0..n)
            .map(|_| pad_labels(&[[1.0, 0.5, 0.5, 0.5, 0.5]], 3))
            .collect();
        InMemorySource::new(images, labels, 2, shuffle)
    }

    #[test]
    fn test_batch_shapes() {
        let src = sample_source(6, None);
        assert_eq!(src.num_batches(), 3);
        let (images, labels) = src.batch(0, 0).unwrap();
        assert_eq!(images.shape(), &[2, 3, 4, 4]);
        assert_eq!(labels.shape(), &[2, 3, 5]);
    }

    #[test]
    fn test_unshuffled_order_is_identity() {
        let src = sample_source(4, None);
        let (images, _) = src.batch(0, 1).unwrap();
        assert!((images[[0, 0, 0, 0]] - 0.5).abs() < 1e-6);
        assert!((images[[1, 0, 0, 0]] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_shuffle_is_deterministic_per_epoch() {
        let src = sample_source(8, Some(3));
        let a = src.batch(1, 0).unwrap().0;
        let b = src.batch(1, 0).unwrap().0;
        assert_eq!(a, b);

        // A full epoch covers every sample exactly once.
        let epoch_order = |epoch: usize| -> Vec<i32> {
            (0..src.num_batches())
                .flat_map(|i| {
                    let (images, _) = src.batch(epoch, i).unwrap();
                    (0..2)
                        .map(|b| (images[[b, 0, 0, 0]] * 8.0).round() as i32)
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        let mut seen = epoch_order(1);
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());

        // And successive epochs draw fresh permutations.
        let first = epoch_order(1);
        assert!((2..6).any(|e| epoch_order(e) != first));
    }

    #[test]
    fn test_out_of_range_batch_is_an_error() {
        let src = sample_source(4, None);
        assert!(src.batch(0, 2).is_err());
    }

    #[test]
    fn test_pad_labels_truncates_and_pads() {
        let rows = [
            [1.0, 0.1, 0.1, 0.2, 0.2],
            [2.0, 0.5, 0.5, 0.3, 0.3],
            [3.0, 0.9, 0.9, 0.1, 0.1],
        ];
        let table = pad_labels(&rows, 2);
        assert_eq!(table.nrows(), 2);
        assert_eq!(table[[1, 0]], 2.0);

        let table = pad_labels(&rows[..1], 4);
        assert_eq!(table[[0, 0]], 1.0);
        assert!(table.row(2).iter().all(|&v| v == 0.0));
    }
}
