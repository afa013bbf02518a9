//! # Denoising Diffusion Implicit Models
//!
//! DDIM maps the noisy embeddings at timestep `t` to an estimate at `t - k`
//! with a closed form update, skipping the intermediate timesteps. The model
//! does not predict the noise directly: it predicts token logits, the clean
//! embedding estimate is the expected word embedding under these logits and
//! the noise is recovered by inverting the forward process.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use super::NoiseSchedule;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tch::Tensor;

/// The part of a denoising network the sampler relies on.
pub trait Denoiser {
    /// Vocabulary logits for a batch of noisy embeddings, all at `timestep`.
    fn denoise(&self, noisy: &Tensor, timestep: usize) -> Result<Tensor>;

    /// Clean embedding estimate from logits.
    fn expected_embedding(&self, logits: &Tensor) -> Tensor;
}

/// The DDIM sampler.
#[derive(Debug, Clone)]
pub struct DdimSampler {
    schedule: NoiseSchedule,
    stride: usize,
    timesteps: Vec<usize>,
}

impl DdimSampler {
    /// Creates a sampler visiting `max_step - 1, max_step - 1 - stride, ...`
    /// down to the last positive timestep.
    pub fn new(schedule: NoiseSchedule, stride: usize) -> Result<Self> {
        if stride == 0 {
            return Err(Error::Config("the DDIM stride has to be positive".to_string()));
        }
        let mut timesteps: Vec<usize> = (1..schedule.max_step()).rev().step_by(stride).collect();
        // A single step schedule has no positive timestep, run it once at 0.
        if timesteps.is_empty() {
            timesteps.push(0)
        }
        Ok(Self { schedule, stride, timesteps })
    }

    pub fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Performs a reverse step from timestep `t` to `t - stride` given the
    /// current noisy embeddings and the denoised estimate.
    pub fn step(&self, noisy: &Tensor, denoised: &Tensor, t: usize) -> Result<Tensor> {
        let alpha_t = self.schedule.alpha_current(t)?;
        let alpha_tk = self.schedule.alpha_target(t, self.stride)?;
        let noise = (noisy - alpha_t.sqrt() * denoised) / (1. - alpha_t).sqrt();
        let coef = ((1. - alpha_tk) / alpha_tk).sqrt() - ((1. - alpha_t) / alpha_t).sqrt();
        Ok(alpha_tk.sqrt() * (noisy / alpha_t.sqrt() + coef * noise))
    }

    /// Runs the full reverse process from `noise` and returns the argmax
    /// tokens of the last prediction, shape `(batch, seq_len)`.
    pub fn sample<D: Denoiser + ?Sized>(&self, model: &D, noise: Tensor) -> Result<Tensor> {
        self.sample_with_progress(model, noise, None, |_| ())
    }

    /// Same as [`DdimSampler::sample`], `on_step` is called with each
    /// timestep once it is processed and `stop` is checked before each step.
    pub fn sample_with_progress<D, F>(
        &self,
        model: &D,
        noise: Tensor,
        stop: Option<&AtomicBool>,
        mut on_step: F,
    ) -> Result<Tensor>
    where
        D: Denoiser + ?Sized,
        F: FnMut(usize),
    {
        let _no_grad = tch::no_grad_guard();
        let mut noisy = noise;
        let mut logits = None;
        for &t in self.timesteps.iter() {
            if stop.map_or(false, |s| s.load(Ordering::Relaxed)) {
                return Err(Error::Cancelled(t));
            }
            let step_logits = model.denoise(&noisy, t)?;
            let denoised = model.expected_embedding(&step_logits);
            noisy = self.step(&noisy, &denoised, t)?;
            logits = Some(step_logits);
            tracing::debug!(timestep = t, "ddim step");
            on_step(t)
        }
        match logits {
            Some(logits) => Ok(logits.argmax(-1, false)),
            None => Err(Error::Config("empty DDIM schedule".to_string())),
        }
    }
}
