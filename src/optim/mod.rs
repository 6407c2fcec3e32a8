//! Patch optimization: Adam updates and plateau-based learning-rate control.

pub mod adam;
pub mod plateau;

pub use adam::{Adam, AdamConfig};
pub use plateau::{PlateauConfig, ReduceLrOnPlateau};
