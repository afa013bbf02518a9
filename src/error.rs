//! Errors raised by the diffusion model and its sampler.
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid model, schedule or sampler settings. Reported before any
    /// tensor computation starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// The noise schedule produced a value outside of its domain, this points
    /// at a misconfigured schedule rather than at a numerical accident.
    #[error("non finite alpha {alpha} for timestep {timestep} (max_step {max_step})")]
    NonFiniteAlpha { timestep: usize, max_step: usize, alpha: f64 },

    #[error("pretrained weights not found at {0:?}")]
    MissingWeights(PathBuf),

    #[error("checkpoint does not match the model: {skipped} skipped keys, {missing} missing parameters")]
    CheckpointMismatch { skipped: usize, missing: usize },

    #[error("sampling cancelled before timestep {0}")]
    Cancelled(usize),

    #[error(transparent)]
    Tch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
