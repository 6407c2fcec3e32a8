//! Directory-backed YOLO-format dataset.
//!
//! Images live in one directory, labels in another as same-stem `.txt`
//! files with one `class cx cy w h` row per object (normalized
//! coordinates). Images are letterboxed to the model input size — scaled
//! to fit, centred on a gray canvas — and labels are remapped into the
//! letterboxed frame and padded to the fixed capacity.
//!
//! Sample decoding inside a batch fans out over rayon; the batch itself is
//! assembled in index order, so the result is independent of worker timing.

use std::path::{Path, PathBuf};

use anyhow::Context;
use image::imageops::FilterType;
use ndarray::{Array2, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use super::{BatchSource, ImageBatch, LabelBatch, LABEL_FIELDS};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Letterbox fill value.
const PAD_GRAY: f32 = 0.5;

/// YOLO images + labels on disk.
pub struct YoloDirSource {
    /// (image path, label path) per sample, sorted by file name.
    entries: Vec<(PathBuf, PathBuf)>,

    model_in_sz: [usize; 2],
    max_labels: usize,
    batch_size: usize,
    shuffle_seed: Option<u64>,
}

impl YoloDirSource {
    pub fn new(
        image_dir: &Path,
        label_dir: &Path,
        model_in_sz: [usize; 2],
        max_labels: usize,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> anyhow::Result<Self> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(image_dir)
            .with_context(|| format!("listing image dir {}", image_dir.display()))?
        {
            let path = entry?.path();
            let ext_ok = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if !ext_ok {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("image file with non-UTF8 name")?;
            entries.push((path.clone(), label_dir.join(format!("{stem}.txt"))));
        }
        anyhow::ensure!(
            !entries.is_empty(),
            "no images found in {}",
            image_dir.display()
        );
        entries.sort();
        Ok(Self {
            entries,
            model_in_sz,
            max_labels,
            batch_size,
            shuffle_seed,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.entries.len()
    }

    fn order(&self, epoch: usize) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.entries.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            idx.shuffle(&mut rng);
        }
        idx
    }

    /// Decode one sample: letterboxed image plus remapped, padded labels.
    fn load_sample(&self, sample: usize) -> anyhow::Result<(Array3<f32>, Array2<f32>)> {
        let (img_path, label_path) = &self.entries[sample];
        let [th, tw] = self.model_in_sz;

        let img = image::open(img_path)
            .with_context(|| format!("decoding {}", img_path.display()))?
            .to_rgb8();
        let (ow, oh) = (img.width() as usize, img.height() as usize);

        // Scale to fit, centre on a gray canvas.
        let ratio = (tw as f32 / ow as f32).min(th as f32 / oh as f32);
        let (sw, sh) = (
            ((ow as f32 * ratio).round() as usize).max(1),
            ((oh as f32 * ratio).round() as usize).max(1),
        );
        let resized = image::imageops::resize(&img, sw as u32, sh as u32, FilterType::Triangle);
        let (off_x, off_y) = ((tw - sw) / 2, (th - sh) / 2);

        let mut out = Array3::from_elem((3, th, tw), PAD_GRAY);
        for y in 0..sh {
            for x in 0..sw {
                let px = resized.get_pixel(x as u32, y as u32).0;
                for c in 0..3 {
                    out[[c, y + off_y, x + off_x]] = px[c] as f32 / 255.0;
                }
            }
        }

        // Labels are optional: a missing file means an unlabelled image.
        let mut table = Array2::zeros((self.max_labels, LABEL_FIELDS));
        if label_path.is_file() {
            let text = std::fs::read_to_string(label_path)
                .with_context(|| format!("reading {}", label_path.display()))?;
            let mut slot = 0usize;
            for line in text.lines() {
                if slot >= self.max_labels {
                    break;
                }
                let fields: Vec<f32> = line
                    .split_whitespace()
                    .filter_map(|f| f.parse().ok())
                    .collect();
                // Malformed rows are dropped, not propagated.
                if fields.len() != LABEL_FIELDS {
                    continue;
                }
                let (cls, cx, cy, w, h) = (fields[0], fields[1], fields[2], fields[3], fields[4]);
                if w <= 0.0 || h <= 0.0 {
                    continue;
                }
                // Remap into the letterboxed frame.
                table[[slot, 0]] = cls;
                table[[slot, 1]] = (cx * sw as f32 + off_x as f32) / tw as f32;
                table[[slot, 2]] = (cy * sh as f32 + off_y as f32) / th as f32;
                table[[slot, 3]] = w * sw as f32 / tw as f32;
                table[[slot, 4]] = h * sh as f32 / th as f32;
                slot += 1;
            }
        }
        Ok((out, table))
    }
}

impl BatchSource for YoloDirSource {
    fn num_batches(&self) -> usize {
        self.entries.len() / self.batch_size
    }

    fn batch(&self, epoch: usize, index: usize) -> anyhow::Result<(ImageBatch, LabelBatch)> {
        let order = self.order(epoch);
        let start = index * self.batch_size;
        anyhow::ensure!(
            start + self.batch_size <= order.len(),
            "batch index {index} out of range"
        );

        let samples: Vec<(Array3<f32>, Array2<f32>)> = order[start..start + self.batch_size]
            .par_iter()
            .map(|&s| self.load_sample(s))
            .collect::<anyhow::Result<_>>()?;

        let [th, tw] = self.model_in_sz;
        let mut images = Array4::zeros((self.batch_size, 3, th, tw));
        let mut labels = Array3::zeros((self.batch_size, self.max_labels, LABEL_FIELDS));
        for (b, (img, table)) in samples.into_iter().enumerate() {
            images.index_axis_mut(Axis(0), b).assign(&img);
            labels.index_axis_mut(Axis(0), b).assign(&table);
        }
        Ok((images, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn fixture_dirs(tag: &str, n: usize) -> (PathBuf, PathBuf) {
        let root = std::env::temp_dir().join(format!(
            "advpatch_yolo_{}_{}",
            tag,
            std::process::id()
        ));
        let image_dir = root.join("images");
        let label_dir = root.join("labels");
        std::fs::create_dir_all(&image_dir).unwrap();
        std::fs::create_dir_all(&label_dir).unwrap();
        for i in 0..n {
            let img = RgbImage::from_fn(16, 16, |_, _| Rgb([(40 * i) as u8, 80, 120]));
            img.save(image_dir.join(format!("img_{i}.png"))).unwrap();
            std::fs::write(
                label_dir.join(format!("img_{i}.txt")),
                "0 0.5 0.5 0.5 0.5\nbad line\n1 0.25 0.25 -0.1 0.2\n",
            )
            .unwrap();
        }
        (image_dir, label_dir)
    }

    #[test]
    fn test_loads_and_letterboxes() {
        let (image_dir, label_dir) = fixture_dirs("basic", 4);
        let src =
            YoloDirSource::new(&image_dir, &label_dir, [32, 32], 8, 2, None).unwrap();
        assert_eq!(src.num_samples(), 4);
        assert_eq!(src.num_batches(), 2);

        let (images, labels) = src.batch(0, 0).unwrap();
        assert_eq!(images.shape(), &[2, 3, 32, 32]);
        assert_eq!(labels.shape(), &[2, 8, 5]);
        assert!(images.iter().all(|&v| (0.0..=1.0).contains(&v)));

        // Square input fills the square canvas: the centre box stays put.
        assert!((labels[[0, 0, 1]] - 0.5).abs() < 1e-3);
        assert!((labels[[0, 0, 3]] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_malformed_label_rows_are_dropped() {
        let (image_dir, label_dir) = fixture_dirs("malformed", 2);
        let src =
            YoloDirSource::new(&image_dir, &label_dir, [32, 32], 8, 1, None).unwrap();
        let (_, labels) = src.batch(0, 0).unwrap();
        // Only the first row survives: "bad line" fails to parse and the
        // negative-width box is rejected.
        assert!((labels[[0, 0, 3]] - 0.5).abs() < 1e-3);
        assert!(labels
            .index_axis(Axis(0), 0)
            .outer_iter()
            .skip(1)
            .all(|row| row.iter().all(|&v| v == 0.0)));
    }

    #[test]
    fn test_missing_label_file_is_unlabelled() {
        let (image_dir, label_dir) = fixture_dirs("missing", 2);
        std::fs::remove_file(label_dir.join("img_0.txt")).unwrap();
        let src =
            YoloDirSource::new(&image_dir, &label_dir, [32, 32], 4, 1, None).unwrap();
        let (_, labels) = src.batch(0, 0).unwrap();
        assert!(labels.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_empty_dir_is_an_error() {
        let root = std::env::temp_dir().join(format!("advpatch_yolo_empty_{}", std::process::id()));
        std::fs::create_dir_all(&root).unwrap();
        assert!(YoloDirSource::new(&root, &root, [32, 32], 4, 1, None).is_err());
    }
}
