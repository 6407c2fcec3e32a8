//! Run configuration.
//!
//! One immutable `TrainConfig` is loaded from a JSON file, validated once,
//! and passed by reference to every component constructor. Nothing reads
//! configuration ambiently.
//!
//! Validation is fail-fast: an unrecognized loss target, a degenerate patch
//! size, or a missing palette file is a fatal error raised before any
//! optimization state is constructed.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// How the detector's objectness and class scores combine into the
/// confidence the attack drives down. Closed set, resolved once at init.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossTarget {
    /// Objectness only.
    Objectness,

    /// Target-class score only.
    ClassScore,

    /// Product of objectness and target-class score.
    ObjectnessClass,
}

impl LossTarget {
    /// Parse the configuration vocabulary: `"obj"`, `"cls"`, `"obj * cls"`.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
            "obj" => Ok(LossTarget::Objectness),
            "cls" => Ok(LossTarget::ClassScore),
            "obj * cls" | "obj*cls" => Ok(LossTarget::ObjectnessClass),
            other => bail!("loss target {other:?} not implemented (expected \"obj\", \"cls\" or \"obj * cls\")"),
        }
    }

    /// Combine one candidate's objectness and class score.
    pub fn combine(&self, obj: f32, cls: f32) -> f32 {
        match self {
            LossTarget::Objectness => obj,
            LossTarget::ClassScore => cls,
            LossTarget::ObjectnessClass => obj * cls,
        }
    }

    /// Partial derivatives of `combine` with respect to (obj, cls).
    pub fn grads(&self, obj: f32, cls: f32) -> (f32, f32) {
        match self {
            LossTarget::Objectness => (1.0, 0.0),
            LossTarget::ClassScore => (0.0, 1.0),
            LossTarget::ObjectnessClass => (cls, obj),
        }
    }
}

impl fmt::Display for LossTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LossTarget::Objectness => "obj",
            LossTarget::ClassScore => "cls",
            LossTarget::ObjectnessClass => "obj * cls",
        };
        f.write_str(s)
    }
}

/// Where the initial patch pixels come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchSource {
    /// Uniform 0.5 fill.
    Gray,

    /// Uniform random in [0, 1).
    Random,

    /// An image file, resized to the configured patch size.
    File(PathBuf),
}

impl PatchSource {
    /// `"gray"` and `"random"` are keywords; anything else is a path.
    pub fn parse(s: &str) -> Self {
        match s {
            "gray" => PatchSource::Gray,
            "random" => PatchSource::Random,
            path => PatchSource::File(PathBuf::from(path)),
        }
    }
}

/// The full training configuration, deserialized from a JSON file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Name used for run directories and checkpoint files.
    pub patch_name: String,

    /// Patch size in pixels as (height, width).
    pub patch_size: [usize; 2],

    /// Initial patch source: `"gray"`, `"random"`, or an image path.
    #[serde(default = "default_patch_src")]
    pub patch_src: String,

    /// Loss target rule: `"obj"`, `"cls"`, or `"obj * cls"`.
    pub loss_target: String,

    /// Index of the attacked class in the detector's score vector.
    #[serde(default)]
    pub class_id: usize,

    /// Number of classes the detector scores.
    #[serde(default = "default_n_classes")]
    pub n_classes: usize,

    /// Detector input size in pixels as (height, width).
    pub model_in_sz: [usize; 2],

    /// Fixed per-image label capacity; unused slots are zero-padded.
    #[serde(default = "default_max_labels")]
    pub max_labels: usize,

    /// Training image directory.
    #[serde(default)]
    pub image_dir: PathBuf,

    /// YOLO-format label directory.
    #[serde(default)]
    pub label_dir: PathBuf,

    pub batch_size: usize,

    pub n_epochs: usize,

    /// Initial Adam learning rate.
    pub start_lr: f32,

    /// Printability loss weight.
    #[serde(default = "default_nps_mult")]
    pub nps_mult: f32,

    /// Smoothness loss weight.
    #[serde(default = "default_tv_mult")]
    pub tv_mult: f32,

    /// Saliency (colourfulness) loss weight. Zero disables the term.
    #[serde(default)]
    pub sal_mult: f32,

    /// Floor for the weighted smoothness term: the loop uses
    /// `max(tv_mult * tv, min_tv_loss)`.
    #[serde(default = "default_min_tv_loss")]
    pub min_tv_loss: f32,

    /// Patch opacity when compositing onto images.
    #[serde(default = "default_patch_alpha")]
    pub patch_alpha: f32,

    /// Patch side as a fraction of sqrt(box area).
    #[serde(default = "default_target_size_frac")]
    pub target_size_frac: f32,

    /// Enable per-instance photometric jitter.
    #[serde(default = "default_true")]
    pub transform_patches: bool,

    /// Enable per-instance random rotation.
    #[serde(default = "default_true")]
    pub rotate_patches: bool,

    /// Flat list of printable RGB triplets, one `r,g,b` line per colour.
    pub triplet_printfile: PathBuf,

    /// Root directory for run artifacts.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Emit metrics every this many batches.
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,

    /// Bounded prefetch queue depth for the data loader.
    #[serde(default = "default_prefetch_depth")]
    pub prefetch_depth: usize,

    /// Master seed for patch init, transform sampling and shuffling.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Surface numeric anomalies and dump per-batch composites.
    #[serde(default)]
    pub debug_mode: bool,
}

fn default_patch_src() -> String {
    "gray".to_string()
}
fn default_n_classes() -> usize {
    80
}
fn default_max_labels() -> usize {
    48
}
fn default_nps_mult() -> f32 {
    0.01
}
fn default_tv_mult() -> f32 {
    2.5
}
fn default_min_tv_loss() -> f32 {
    0.1
}
fn default_patch_alpha() -> f32 {
    1.0
}
fn default_target_size_frac() -> f32 {
    0.3
}
fn default_true() -> bool {
    true
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("runs")
}
fn default_log_interval() -> usize {
    15
}
fn default_prefetch_depth() -> usize {
    2
}
fn default_seed() -> u64 {
    42
}

impl TrainConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: TrainConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// The parsed loss-target rule.
    pub fn loss_target(&self) -> anyhow::Result<LossTarget> {
        LossTarget::parse(&self.loss_target)
    }

    /// The parsed patch source.
    pub fn patch_source(&self) -> PatchSource {
        PatchSource::parse(&self.patch_src)
    }

    /// Fail-fast checks, run before any optimization state exists.
    pub fn validate(&self) -> anyhow::Result<()> {
        let [ph, pw] = self.patch_size;
        if ph == 0 || pw == 0 {
            bail!("patch_size must be positive, got {}x{}", ph, pw);
        }
        let [mh, mw] = self.model_in_sz;
        if mh == 0 || mw == 0 {
            bail!("model_in_sz must be positive, got {}x{}", mh, mw);
        }
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.max_labels == 0 {
            bail!("max_labels must be positive");
        }
        if self.log_interval == 0 {
            bail!("log_interval must be positive");
        }
        if !(self.start_lr.is_finite() && self.start_lr > 0.0) {
            bail!("start_lr must be a positive finite number");
        }
        if !(0.0..=1.0).contains(&self.patch_alpha) {
            bail!("patch_alpha must lie in [0, 1], got {}", self.patch_alpha);
        }
        if self.target_size_frac <= 0.0 {
            bail!("target_size_frac must be positive");
        }
        if self.class_id >= self.n_classes {
            bail!(
                "class_id {} out of range for {} classes",
                self.class_id,
                self.n_classes
            );
        }
        self.loss_target()?;
        if let PatchSource::File(p) = self.patch_source() {
            if !p.is_file() {
                bail!("patch source image {} does not exist", p.display());
            }
        }
        Ok(())
    }
}
