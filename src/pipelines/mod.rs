//! # Pipelines

pub mod text_diffusion;
