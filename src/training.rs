//! # Training
//!
//! Mini-batch training of the denoiser with AdamW, a linear warmup followed by
//! a linear decay of the learning rate, and gradient norm clipping. The weights
//! are written to `checkpoint-<step>.ot` after each epoch and to `bestloss.ot`
//! whenever the evaluation loss improves.
use crate::data::{Batch, TextDataset};
use crate::models::diffusion_bert::DiffusionBert;
use crate::transformers::MaskedLmBackbone;
use serde::Deserialize;
use std::path::PathBuf;
use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub warmup_steps: usize,
    pub weight_decay: f64,
    pub learning_rate: f64,
    pub logging_steps: usize,
    pub max_grad_norm: f64,
    pub output_dir: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            train_batch_size: 16,
            eval_batch_size: 64,
            warmup_steps: 500,
            weight_decay: 0.01,
            learning_rate: 5e-5,
            logging_steps: 10,
            max_grad_norm: 1.0,
            output_dir: PathBuf::from("./models"),
        }
    }
}

impl TrainingConfig {
    /// Learning rate at optimizer step `step` out of `total_steps`.
    pub fn learning_rate_at(&self, step: usize, total_steps: usize) -> f64 {
        if step < self.warmup_steps {
            return self.learning_rate * step as f64 / self.warmup_steps as f64;
        }
        let decay_steps = total_steps.saturating_sub(self.warmup_steps).max(1);
        let remaining = total_steps.saturating_sub(step);
        self.learning_rate * remaining as f64 / decay_steps as f64
    }
}

/// Rescales the gradients of `parameters` in place so that their global norm
/// is at most `max_norm`, returns the norm before clipping.
pub fn clip_grad_norm(parameters: &[Tensor], max_norm: f64) -> f64 {
    tch::no_grad(|| {
        let grads: Vec<Tensor> =
            parameters.iter().map(|p| p.grad()).filter(|g| g.defined()).collect();
        let total_norm = grads
            .iter()
            .map(|g| g.square().sum(Kind::Double).double_value(&[]))
            .sum::<f64>()
            .sqrt();
        if total_norm > max_norm {
            let scale = max_norm / (total_norm + 1e-6);
            for mut g in grads {
                g *= scale;
            }
        }
        total_norm
    })
}

fn load_batch<D: TextDataset>(
    dataset: &D,
    indexes: &[usize],
    device: Device,
) -> anyhow::Result<Batch> {
    let examples = indexes.iter().map(|&i| dataset.item(i)).collect::<anyhow::Result<Vec<_>>>()?;
    Batch::collate(&examples, device)
}

fn shuffled(len: usize) -> anyhow::Result<Vec<usize>> {
    let perm = Tensor::randperm(len as i64, (Kind::Int64, Device::Cpu));
    Ok(Vec::<i64>::try_from(&perm)?.into_iter().map(|i| i as usize).collect())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSummary {
    pub steps: usize,
    pub best_eval_loss: f64,
}

#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> anyhow::Result<Self> {
        if config.train_batch_size == 0 || config.eval_batch_size == 0 {
            anyhow::bail!("batch sizes must be positive")
        }
        if config.logging_steps == 0 {
            anyhow::bail!("logging_steps must be positive")
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Mean loss over `dataset`, each example corrupted at a random timestep.
    pub fn evaluate<B: MaskedLmBackbone, D: TextDataset>(
        &self,
        model: &DiffusionBert<B>,
        dataset: &D,
    ) -> anyhow::Result<f64> {
        if dataset.is_empty() {
            anyhow::bail!("empty evaluation set")
        }
        let _guard = tch::no_grad_guard();
        let indexes: Vec<usize> = (0..dataset.len()).collect();
        let mut total = 0f64;
        for chunk in indexes.chunks(self.config.eval_batch_size) {
            let batch = load_batch(dataset, chunk, model.device())?;
            let out = model.forward(
                &batch.token_ids,
                &batch.type_ids,
                &batch.attention_mask,
                None,
                false,
            )?;
            total += out.loss.double_value(&[]) * chunk.len() as f64;
        }
        Ok(total / dataset.len() as f64)
    }

    pub fn train<B: MaskedLmBackbone, D: TextDataset, E: TextDataset>(
        &self,
        model: &DiffusionBert<B>,
        vs: &nn::VarStore,
        train_set: &D,
        eval_set: &E,
    ) -> anyhow::Result<TrainingSummary> {
        let config = &self.config;
        if train_set.is_empty() {
            anyhow::bail!("empty training set")
        }
        std::fs::create_dir_all(&config.output_dir)?;
        let mut opt = nn::AdamW { wd: config.weight_decay, ..Default::default() }
            .build(vs, config.learning_rate)?;
        let trainable: Vec<Tensor> =
            vs.trainable_variables().into_iter().filter(|v| v.requires_grad()).collect();
        let steps_per_epoch = (train_set.len() + config.train_batch_size - 1) / config.train_batch_size;
        let total_steps = steps_per_epoch * config.epochs;
        tracing::info!(
            examples = train_set.len(),
            parameters = trainable.len(),
            total_steps,
            "start training"
        );

        let mut step = 0;
        let mut best_eval_loss = f64::INFINITY;
        for epoch in 1..=config.epochs {
            let order = shuffled(train_set.len())?;
            for chunk in order.chunks(config.train_batch_size) {
                let batch = load_batch(train_set, chunk, model.device())?;
                let lr = config.learning_rate_at(step, total_steps);
                opt.set_lr(lr);
                let out = model.forward(
                    &batch.token_ids,
                    &batch.type_ids,
                    &batch.attention_mask,
                    None,
                    true,
                )?;
                opt.zero_grad();
                out.loss.backward();
                let grad_norm = clip_grad_norm(&trainable, config.max_grad_norm);
                opt.step();
                step += 1;
                if step % config.logging_steps == 0 {
                    let loss = out.loss.double_value(&[]);
                    tracing::info!(epoch, step, loss, lr, grad_norm, "train");
                }
            }

            let eval_loss = self.evaluate(model, eval_set)?;
            tracing::info!(epoch, step, eval_loss, "eval");
            vs.save(config.output_dir.join(format!("checkpoint-{step}.ot")))?;
            if eval_loss < best_eval_loss {
                best_eval_loss = eval_loss;
                vs.save(config.output_dir.join("bestloss.ot"))?;
                tracing::info!(step, eval_loss, "new best eval loss");
            }
        }
        Ok(TrainingSummary { steps: step, best_eval_loss })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::word_level_encoder;
    use crate::data::TextCorpus;
    use crate::transformers::bert::{tests::tiny_config, Head};

    #[test]
    fn warmup_then_linear_decay() {
        let config = TrainingConfig { warmup_steps: 10, learning_rate: 1e-3, ..Default::default() };
        assert_eq!(config.learning_rate_at(0, 110), 0.);
        assert!((config.learning_rate_at(5, 110) - 5e-4).abs() < 1e-12);
        assert!((config.learning_rate_at(10, 110) - 1e-3).abs() < 1e-12);
        assert!((config.learning_rate_at(60, 110) - 5e-4).abs() < 1e-12);
        assert_eq!(config.learning_rate_at(110, 110), 0.);
        assert_eq!(config.learning_rate_at(200, 110), 0.);

        let no_warmup = TrainingConfig { warmup_steps: 0, learning_rate: 1e-3, ..Default::default() };
        assert_eq!(no_warmup.learning_rate_at(0, 4), 1e-3);
    }

    #[test]
    fn defaults() {
        let config = TrainingConfig::default();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.train_batch_size, 16);
        assert_eq!(config.eval_batch_size, 64);
        assert_eq!(config.learning_rate, 5e-5);
        let config: TrainingConfig = serde_json::from_str(r#"{"epochs": 1}"#).unwrap();
        assert_eq!(config.epochs, 1);
        assert_eq!(config.warmup_steps, 500);
        assert!(Trainer::new(TrainingConfig { train_batch_size: 0, ..config }).is_err());
    }

    #[test]
    fn gradient_clipping() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().zeros("w", &[4]);
        let loss = (&w * Tensor::from_slice(&[3f32, 4., 0., 0.])).sum(Kind::Float);
        loss.backward();
        let norm = clip_grad_norm(&[w.shallow_clone()], 1.0);
        assert!((norm - 5.).abs() < 1e-5);
        let clipped = w.grad().square().sum(Kind::Float).sqrt().double_value(&[]);
        assert!((clipped - 1.).abs() < 1e-4, "{clipped}");
    }

    #[test]
    fn train_one_epoch() {
        let dir = std::env::temp_dir().join(format!("diffusion-bert-train-{}", std::process::id()));
        let vs = nn::VarStore::new(Device::Cpu);
        let model =
            DiffusionBert::bert(&vs.root(), &tiny_config(), Head::PreTraining, 8, 10).unwrap();
        let texts = ["the cat sat", "the mat", "cat on the mat", "sat on"];
        let corpus =
            TextCorpus::new(texts.iter().map(|s| s.to_string()).collect(), word_level_encoder(8));
        let words_before = vs.variables()["bert.embeddings.word_embeddings.weight"].copy();

        let config = TrainingConfig {
            epochs: 1,
            train_batch_size: 2,
            eval_batch_size: 3,
            warmup_steps: 0,
            learning_rate: 1e-3,
            logging_steps: 1,
            output_dir: dir.clone(),
            ..Default::default()
        };
        let summary = Trainer::new(config).unwrap().train(&model, &vs, &corpus, &corpus).unwrap();
        assert_eq!(summary.steps, 2);
        assert!(summary.best_eval_loss.is_finite());
        assert!(dir.join("checkpoint-2.ot").exists());
        assert!(dir.join("bestloss.ot").exists());

        let variables = vs.variables();
        assert!(variables["bert.embeddings.word_embeddings.weight"].equal(&words_before));
        let time_embed = variables["time_embed.weight"].abs().sum(Kind::Float).double_value(&[]);
        assert!(time_embed > 0.);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
