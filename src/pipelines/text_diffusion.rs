//! Unconditional text generation with a diffusion BERT model.
use crate::checkpoint::{self, LoadMode};
use crate::error::{Error, Result};
use crate::models::diffusion_bert::DiffusionBert;
use crate::schedulers::ddim::DdimSampler;
use crate::transformers::bert;
use crate::transformers::MaskedLmBackbone;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use tch::{nn, Device, Kind};

#[derive(Clone, Debug)]
pub struct TextDiffusionConfig {
    pub bert: bert::Config,
    pub head: bert::Head,
    pub max_len: usize,
    pub max_step: usize,
}

impl TextDiffusionConfig {
    /// `bert-mini` trained on ROCStories.
    // https://huggingface.co/prajjwal1/bert-mini
    pub fn rocstories() -> Self {
        Self {
            bert: bert::Config::bert_mini(),
            head: bert::Head::for_model_name("prajjwal1/bert-mini"),
            max_len: 64,
            max_step: 2000,
        }
    }

    /// Builds a model with freshly initialized weights.
    pub fn build_model(&self, device: Device) -> Result<(nn::VarStore, DiffusionBert)> {
        let vs = nn::VarStore::new(device);
        let model =
            DiffusionBert::bert(&vs.root(), &self.bert, self.head, self.max_len, self.max_step)?;
        Ok((vs, model))
    }

    /// Builds a model and loads `weights` into it, entries not matching a
    /// parameter are reported and skipped unless `mode` is strict.
    pub fn build_pretrained<P: AsRef<Path>>(
        &self,
        weights: P,
        mode: LoadMode,
        device: Device,
    ) -> Result<(nn::VarStore, DiffusionBert)> {
        let weights = weights.as_ref();
        if !weights.exists() {
            return Err(Error::MissingWeights(weights.to_path_buf()));
        }
        let (vs, model) = self.build_model(device)?;
        checkpoint::load(&vs, weights, Some(checkpoint::DATA_PARALLEL_PREFIX), mode)?;
        Ok((vs, model))
    }
}

/// Samples `num_samples` sequences of `max_len` tokens from pure noise with a
/// DDIM stride of `stride`.
pub fn generate<B, F>(
    model: &DiffusionBert<B>,
    stride: usize,
    num_samples: usize,
    stop: Option<&AtomicBool>,
    on_step: F,
) -> Result<Vec<Vec<i64>>>
where
    B: MaskedLmBackbone,
    F: FnMut(usize),
{
    if num_samples == 0 {
        return Err(Error::Config("the number of samples must be positive".to_string()));
    }
    let sampler = DdimSampler::new(*model.schedule(), stride)?;
    tracing::info!(num_samples, stride, steps = sampler.timesteps().len(), "sampling");
    let noise = model.noise(num_samples as i64, model.max_len());
    let tokens = sampler.sample_with_progress(model, noise, stop, on_step)?;
    let tokens = tokens.to_device(Device::Cpu).to_kind(Kind::Int64).view([-1]);
    let tokens = Vec::<i64>::try_from(&tokens)?;
    Ok(tokens.chunks(model.max_len() as usize).map(|c| c.to_vec()).collect())
}
