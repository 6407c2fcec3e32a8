//! Orchestrates the full optimization:
//! transform → composite → score → loss → backward → update → clamp,
//! across epochs and batches, with plateau-based learning-rate control and
//! per-epoch checkpointing.
//!
//! The patch is the only mutable state on the compute path. The detector
//! is frozen behind its trait; batches arrive through a bounded prefetch
//! channel; gradient flows back through each stage's analytic VJP and is
//! summed with the regularizer gradients before the Adam step.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use ndarray::{Array1, Array3};

use crate::config::TrainConfig;
use crate::data::{BatchSource, ImageBatch, LabelBatch, PrefetchLoader};
use crate::detect::Detector;
use crate::loss::{MaxProbExtractor, NpsLoss, SaliencyLoss, TotalVariationLoss};
use crate::metrics::MetricsSink;
use crate::optim::{Adam, AdamConfig, PlateauConfig, ReduceLrOnPlateau};
use crate::patch::{tensor_to_image, AdvPatch};
use crate::transform::{PatchApplier, PatchTransformer, TransformConfig, TransformSampler};

/// Decomposed losses for one batch.
#[derive(Clone, Copy, Debug)]
pub struct BatchLosses {
    pub total: f32,
    pub det: f32,
    pub nps: f32,
    pub tv: f32,
    pub sal: f32,
}

/// What a finished run reports.
#[derive(Debug)]
pub struct TrainSummary {
    /// Mean total loss per epoch.
    pub epoch_losses: Vec<f32>,

    /// Total loss per batch, across the whole run.
    pub batch_losses: Vec<f32>,

    /// Learning rate after the final epoch.
    pub final_lr: f32,

    /// Saved checkpoint paths, one per epoch.
    pub checkpoints: Vec<PathBuf>,
}

/// Drives patch optimization against a frozen detector.
pub struct PatchTrainer {
    cfg: TrainConfig,
    run_dir: PathBuf,

    patch: AdvPatch,
    sampler: TransformSampler,
    transformer: PatchTransformer,
    applier: PatchApplier,
    transform_cfg: TransformConfig,

    extractor: MaxProbExtractor,
    nps: NpsLoss,
    tv: TotalVariationLoss,
    saliency: SaliencyLoss,

    detector: Box<dyn Detector>,
    source: Arc<dyn BatchSource>,
    sink: Box<dyn MetricsSink>,

    optimizer: Adam,
    scheduler: ReduceLrOnPlateau,
}

impl PatchTrainer {
    /// Construct all training state. Configuration problems — an unknown
    /// loss target, a class id the detector cannot score, a bad palette —
    /// fail here, before the first optimization step.
    pub fn new(
        cfg: &TrainConfig,
        detector: Box<dyn Detector>,
        source: Arc<dyn BatchSource>,
        sink: Box<dyn MetricsSink>,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;
        let target = cfg.loss_target()?;
        if cfg.class_id >= detector.num_classes() {
            bail!(
                "class_id {} out of range for detector with {} classes",
                cfg.class_id,
                detector.num_classes()
            );
        }

        let patch = AdvPatch::from_source(&cfg.patch_source(), cfg.patch_size, cfg.seed)?;
        let nps = NpsLoss::from_file(&cfg.triplet_printfile)?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let run_dir = cfg.log_dir.join(format!("{stamp}_{}", cfg.patch_name));

        let shape = (3, cfg.patch_size[0], cfg.patch_size[1]);
        let optimizer = Adam::new(
            AdamConfig {
                lr: cfg.start_lr,
                ..Default::default()
            },
            shape,
        );

        Ok(Self {
            transform_cfg: TransformConfig {
                target_size_frac: cfg.target_size_frac,
                jitter: cfg.transform_patches,
                rotate: cfg.rotate_patches,
                rand_loc: false,
            },
            sampler: TransformSampler::new(cfg.seed),
            transformer: PatchTransformer::new(),
            applier: PatchApplier::new(cfg.patch_alpha),
            extractor: MaxProbExtractor::new(target, cfg.class_id),
            nps,
            tv: TotalVariationLoss::new(),
            saliency: SaliencyLoss::new(),
            scheduler: ReduceLrOnPlateau::new(PlateauConfig::default()),
            cfg: cfg.clone(),
            run_dir,
            patch,
            detector,
            source,
            sink,
            optimizer,
        })
    }

    pub fn patch(&self) -> &AdvPatch {
        &self.patch
    }

    pub fn run_dir(&self) -> &PathBuf {
        &self.run_dir
    }

    /// Run the configured number of epochs.
    pub fn train(&mut self) -> anyhow::Result<TrainSummary> {
        let epoch_length = self.source.num_batches();
        if epoch_length == 0 {
            bail!("batch source is empty");
        }

        let patch_dir = self.run_dir.join("patches");
        std::fs::create_dir_all(&patch_dir)
            .with_context(|| format!("creating {}", patch_dir.display()))?;
        if self.cfg.debug_mode {
            std::fs::create_dir_all(self.run_dir.join("patch_applied_imgs"))?;
        }
        let cfg_json = serde_json::to_string_pretty(&self.cfg)?;
        std::fs::write(self.run_dir.join("cfg.json"), cfg_json)?;

        let mut summary = TrainSummary {
            epoch_losses: Vec::with_capacity(self.cfg.n_epochs),
            batch_losses: Vec::new(),
            final_lr: self.optimizer.lr(),
            checkpoints: Vec::with_capacity(self.cfg.n_epochs),
        };

        for epoch in 0..self.cfg.n_epochs {
            let mut loader =
                PrefetchLoader::new(self.source.clone(), epoch, self.cfg.prefetch_depth);
            let mut ep_loss = 0.0f32;
            let mut i_batch = 0usize;

            while let Some(batch) = loader.next() {
                let (images, labels) = batch?;
                let losses = self.step_batch(&images, &labels, epoch, i_batch)?;
                ep_loss += losses.total;
                summary.batch_losses.push(losses.total);

                if i_batch % self.cfg.log_interval == 0 {
                    let step = (epoch_length * epoch + i_batch) as u64;
                    self.sink.scalar("total_loss", losses.total, step);
                    self.sink.scalar("loss/det_loss", losses.det, step);
                    self.sink.scalar("loss/nps_loss", losses.nps, step);
                    self.sink.scalar("loss/tv_loss", losses.tv, step);
                    if self.cfg.sal_mult != 0.0 {
                        self.sink.scalar("loss/sal_loss", losses.sal, step);
                    }
                    self.sink.scalar("misc/epoch", epoch as f32, step);
                    self.sink
                        .scalar("misc/learning_rate", self.optimizer.lr(), step);
                    self.sink.snapshot("patch", &self.patch.data.view(), step);
                }
                i_batch += 1;
            }

            let mean = ep_loss / epoch_length as f32;
            summary.epoch_losses.push(mean);

            let lr = self.scheduler.step(mean, self.optimizer.lr());
            self.optimizer.set_lr(lr);
            summary.final_lr = lr;

            let out_path = patch_dir.join(format!("{}_epoch_{epoch}.png", self.cfg.patch_name));
            self.patch.save(&out_path)?;
            summary.checkpoints.push(out_path);

            tracing::info!(epoch, mean_loss = mean, lr, "epoch finished");
        }

        Ok(summary)
    }

    /// One optimization step over one batch.
    fn step_batch(
        &mut self,
        images: &ImageBatch,
        labels: &LabelBatch,
        epoch: usize,
        i_batch: usize,
    ) -> anyhow::Result<BatchLosses> {
        let canvas = (self.cfg.model_in_sz[0], self.cfg.model_in_sz[1]);
        let patch_hw = (self.patch.height(), self.patch.width());
        let n = images.shape()[0];
        anyhow::ensure!(
            images.shape()[2] == canvas.0 && images.shape()[3] == canvas.1,
            "image batch is {}x{} but the detector expects {}x{}",
            images.shape()[2],
            images.shape()[3],
            canvas.0,
            canvas.1
        );

        // Forward: warp, composite, score.
        let params = self
            .sampler
            .sample(&labels.view(), patch_hw, canvas, &self.transform_cfg);
        let (instances, t_rec) = self
            .transformer
            .forward(&self.patch.data.view(), &params, canvas);
        let (composites, a_rec) = self.applier.apply(&images.view(), &instances.view());

        if self.cfg.debug_mode {
            let idx = 1.min(n - 1);
            let img = tensor_to_image(&composites.index_axis(ndarray::Axis(0), idx));
            let path = self
                .run_dir
                .join("patch_applied_imgs")
                .join(format!("e{epoch}_b{i_batch}.png"));
            img.save(&path)
                .with_context(|| format!("writing debug composite {}", path.display()))?;
        }

        let pass = self.detector.forward(&composites.view())?;
        let (max_probs, e_rec) = self.extractor.extract(&pass.output);
        let det = max_probs.iter().sum::<f32>() / n as f32;

        // Regularizers read the patch directly. Zero-weight terms are
        // skipped entirely.
        let patch_view = self.patch.data.view();
        let nps = if self.cfg.nps_mult != 0.0 {
            self.nps.forward(&patch_view)
        } else {
            0.0
        };
        let tv = if self.cfg.tv_mult != 0.0 {
            self.tv.forward(&patch_view)
        } else {
            0.0
        };
        let sal = if self.cfg.sal_mult != 0.0 {
            self.saliency.forward(&patch_view)
        } else {
            0.0
        };

        let nps_term = nps * self.cfg.nps_mult;
        let weighted_tv = tv * self.cfg.tv_mult;
        // The floor is a hard max: once the patch is smooth the term is a
        // constant bias and contributes no gradient.
        let tv_term = weighted_tv.max(self.cfg.min_tv_loss);
        let sal_term = sal * self.cfg.sal_mult;
        let total = det + nps_term + tv_term + sal_term;

        // Backward: detector confidence into the patch via the stage VJPs.
        let grad_per_image = Array1::from_elem(n, 1.0 / n as f32);
        let (grad_obj, grad_cls) = self.extractor.backward(&e_rec, &grad_per_image);
        let grad_images = pass.tape.vjp(&grad_obj, &grad_cls);
        let grad_instances = self.applier.backward(&a_rec, &grad_images.view());
        let mut grad = self.transformer.backward(&t_rec, &grad_instances.view());

        if self.cfg.nps_mult != 0.0 {
            add_scaled(&mut grad, &self.nps.gradient(&patch_view), self.cfg.nps_mult);
        }
        if self.cfg.tv_mult != 0.0 && weighted_tv > self.cfg.min_tv_loss {
            add_scaled(&mut grad, &self.tv.gradient(&patch_view), self.cfg.tv_mult);
        }
        if self.cfg.sal_mult != 0.0 {
            add_scaled(
                &mut grad,
                &self.saliency.gradient(&patch_view),
                self.cfg.sal_mult,
            );
        }

        if self.cfg.debug_mode {
            self.surface_anomalies(
                &[
                    ("det_loss", det),
                    ("nps_loss", nps_term),
                    ("tv_loss", tv_term),
                    ("sal_loss", sal_term),
                ],
                &grad,
                epoch,
                i_batch,
            )?;
        }

        // Update and project back onto [0, 1].
        self.optimizer.step(&mut self.patch.data, &grad);
        self.patch.clamp_unit();
        if self.cfg.debug_mode && !self.patch.is_finite() {
            bail!("patch went non-finite after update at epoch {epoch} batch {i_batch}");
        }

        Ok(BatchLosses {
            total,
            det,
            nps: nps_term,
            tv: tv_term,
            sal: sal_term,
        })
    }

    /// Debug-mode anomaly surfacing: abort on the first non-finite loss
    /// term or gradient entry instead of training through it.
    fn surface_anomalies(
        &self,
        terms: &[(&str, f32)],
        grad: &Array3<f32>,
        epoch: usize,
        i_batch: usize,
    ) -> anyhow::Result<()> {
        for (name, value) in terms {
            if !value.is_finite() {
                bail!("non-finite {name} = {value} at epoch {epoch} batch {i_batch}");
            }
        }
        if let Some((idx, bad)) = grad
            .indexed_iter()
            .find(|(_, v)| !v.is_finite())
            .map(|(idx, v)| (idx, *v))
        {
            bail!(
                "non-finite patch gradient {bad} at {:?}, epoch {epoch} batch {i_batch}",
                idx
            );
        }
        Ok(())
    }
}

/// `acc += scale * term`, elementwise.
fn add_scaled(acc: &mut Array3<f32>, term: &Array3<f32>, scale: f32) {
    acc.scaled_add(scale, term);
}
