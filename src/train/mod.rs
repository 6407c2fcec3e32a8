//! The patch optimization loop.

pub mod trainer;

pub use trainer::{BatchLosses, PatchTrainer, TrainSummary};
