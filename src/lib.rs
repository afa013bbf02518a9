//! # Diffusion BERT
//!
//! Text generation with a pretrained BERT masked language model used as the
//! denoiser of a diffusion process over word embeddings, using Torch via
//! [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - A BERT encoder with its masked LM and pretraining heads, loading
//!   Hugging Face weights.
//! - The diffusion model, a square-root noise schedule and a DDIM sampler.
//! - Dataset adapters, a training loop and a generation pipeline.

pub mod checkpoint;
pub mod data;
pub mod error;
pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod training;
pub mod transformers;
pub mod utils;

pub use error::{Error, Result};
