//! # Models
//!
//! The denoising network and its building blocks.

pub mod diffusion_bert;
pub mod embeddings;
