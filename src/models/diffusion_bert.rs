//! # Diffusion BERT
//!
//! A pretrained masked language model turned into a denoiser working on word
//! embeddings. Training corrupts the (frozen) word embeddings with gaussian
//! noise following the square-root schedule, adds a learned timestep embedding
//! and asks the encoder to recover the original tokens. Sampling goes the other
//! way with the DDIM recurrence from [`crate::schedulers::ddim`].
use super::embeddings::TimestepEmbedding;
use crate::error::{Error, Result};
use crate::schedulers::ddim::Denoiser;
use crate::schedulers::NoiseSchedule;
use crate::transformers::bert::{self, BertModel};
use crate::transformers::MaskedLmBackbone;
use tch::{nn, nn::Module, Device, Kind, Tensor};

/// Target id excluded from the loss, the BERT padding token.
pub const PAD_TOKEN_ID: i64 = 0;

/// What a forward pass returns.
#[derive(Debug)]
pub struct DiffusionOutput {
    /// Scalar cross-entropy against the input tokens.
    pub loss: Tensor,
    /// `(batch, seq_len, vocab_size)`
    pub logits: Tensor,
    /// The `(batch,)` timesteps used to corrupt each example.
    pub timesteps: Tensor,
}

/// Token cross-entropy between `(batch, seq_len, vocab)` logits and the
/// original ids, averaged over the non padding positions. A batch made only
/// of padding has a zero loss.
pub fn token_loss(logits: &Tensor, token_ids: &Tensor) -> Tensor {
    let vocab_size = logits.size()[logits.dim() - 1];
    let total = logits.reshape([-1, vocab_size]).cross_entropy_loss::<Tensor>(
        &token_ids.reshape([-1]),
        None,
        tch::Reduction::Sum,
        PAD_TOKEN_ID,
        0.,
    );
    let targets = token_ids.ne(PAD_TOKEN_ID).sum(Kind::Float).clamp_min(1.);
    total / targets
}

#[derive(Debug)]
pub struct DiffusionBert<B: MaskedLmBackbone = BertModel> {
    backbone: B,
    time_embed: TimestepEmbedding,
    schedule: NoiseSchedule,
    max_len: i64,
}

impl DiffusionBert<BertModel> {
    /// Builds a BERT backed model, the BERT variables live under `bert` and
    /// `cls` and the timestep table under `time_embed`.
    pub fn bert(
        vs: &nn::Path,
        config: &bert::Config,
        head: bert::Head,
        max_len: usize,
        max_step: usize,
    ) -> Result<Self> {
        check_max_len(max_len, config.max_position_embeddings)?;
        let backbone = BertModel::new(vs, config, head);
        Self::new(vs, backbone, max_len, max_step)
    }
}

fn check_max_len(max_len: usize, max_position_embeddings: i64) -> Result<()> {
    if max_len == 0 || max_len as i64 > max_position_embeddings {
        return Err(Error::Config(format!(
            "max_len {max_len} outside of the supported range 1..={max_position_embeddings}"
        )));
    }
    Ok(())
}

impl<B: MaskedLmBackbone> DiffusionBert<B> {
    pub fn new(vs: &nn::Path, backbone: B, max_len: usize, max_step: usize) -> Result<Self> {
        check_max_len(max_len, backbone.max_position_embeddings())?;
        let schedule = NoiseSchedule::new(max_step)?;
        for p in backbone.frozen_parameters() {
            let _ = p.set_requires_grad(false);
        }
        let time_embed =
            TimestepEmbedding::new(vs / "time_embed", max_step as i64, backbone.hidden_size());
        tracing::info!(
            max_len,
            max_step,
            hidden_size = backbone.hidden_size(),
            vocab_size = backbone.vocab_size(),
            "built diffusion model"
        );
        Ok(Self { backbone, time_embed, schedule, max_len: max_len as i64 })
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn max_len(&self) -> i64 {
        self.max_len
    }

    pub fn time_embed(&self) -> &TimestepEmbedding {
        &self.time_embed
    }

    pub fn device(&self) -> Device {
        self.backbone.device()
    }

    fn check_input(&self, token_ids: &Tensor) -> Result<(i64, i64)> {
        match token_ids.size().as_slice() {
            &[bsz, seq_len] if bsz > 0 && seq_len <= self.max_len => Ok((bsz, seq_len)),
            size => Err(Error::Config(format!(
                "expected token ids of shape (batch, seq_len <= {}), got {size:?}",
                self.max_len
            ))),
        }
    }

    fn check_timestep(&self, t: usize) -> Result<()> {
        if t >= self.schedule.max_step() {
            return Err(Error::Config(format!(
                "timestep {t} out of range for max_step {}",
                self.schedule.max_step()
            )));
        }
        Ok(())
    }

    fn check_timesteps(&self, timesteps: &Tensor, bsz: i64) -> Result<()> {
        if timesteps.size() != [bsz] || timesteps.kind() != Kind::Int64 {
            return Err(Error::Config(format!(
                "expected int64 timesteps of shape ({bsz},), got {:?} {:?}",
                timesteps.kind(),
                timesteps.size()
            )));
        }
        let min = timesteps.min().int64_value(&[]);
        let max = timesteps.max().int64_value(&[]);
        if min < 0 || max >= self.schedule.max_step() as i64 {
            return Err(Error::Config(format!(
                "timesteps in {min}..={max} out of range for max_step {}",
                self.schedule.max_step()
            )));
        }
        Ok(())
    }

    fn check_embeddings(&self, xs: &Tensor, bsz: Option<i64>) -> Result<(i64, i64)> {
        let hidden_size = self.backbone.hidden_size();
        match xs.size().as_slice() {
            &[b, seq_len, hidden]
                if b > 0
                    && bsz.map_or(true, |bsz| bsz == b)
                    && seq_len <= self.max_len
                    && hidden == hidden_size =>
            {
                Ok((b, seq_len))
            }
            size => Err(Error::Config(format!(
                "expected embeddings of shape (batch, seq_len <= {}, {hidden_size}), got {size:?}",
                self.max_len
            ))),
        }
    }

    /// Forward diffusion: `sqrt(alpha) * words + sqrt(1 - alpha) * noise + types`
    /// with alpha taken per example from `timesteps`.
    pub fn corrupt(
        &self,
        word_embeddings: &Tensor,
        type_embeddings: &Tensor,
        timesteps: &Tensor,
        noise: &Tensor,
    ) -> Tensor {
        let alpha = self.schedule.alphas(timesteps).view([-1, 1, 1]);
        alpha.sqrt() * word_embeddings + (1f64 - &alpha).sqrt() * noise + type_embeddings
    }

    /// Gaussian noise with the embedding scale, `(batch, seq_len, hidden_size)`.
    pub fn noise(&self, batch_size: i64, seq_len: i64) -> Tensor {
        let hidden_size = self.backbone.hidden_size();
        let noise = Tensor::randn([batch_size, seq_len, hidden_size], (Kind::Float, self.device()));
        noise / (hidden_size as f64).sqrt()
    }

    /// Corrupts `token_ids` at timestep `t`, or at a random timestep per
    /// example when `t` is `None`, and predicts the original tokens back.
    pub fn forward(
        &self,
        token_ids: &Tensor,
        type_ids: &Tensor,
        attention_mask: &Tensor,
        t: Option<usize>,
        train: bool,
    ) -> Result<DiffusionOutput> {
        let (bsz, seq_len) = self.check_input(token_ids)?;
        let options = (Kind::Int64, token_ids.device());
        let timesteps = match t {
            None => Tensor::randint(self.schedule.max_step() as i64, [bsz], options),
            Some(t) => {
                self.check_timestep(t)?;
                Tensor::full([bsz], t as i64, options)
            }
        };
        let noise = self.noise(bsz, seq_len);
        self.forward_with_noise(token_ids, type_ids, attention_mask, &timesteps, &noise, train)
    }

    /// Same as [`DiffusionBert::forward`] with explicit timesteps and noise,
    /// deterministic when `train` is false.
    pub fn forward_with_noise(
        &self,
        token_ids: &Tensor,
        type_ids: &Tensor,
        attention_mask: &Tensor,
        timesteps: &Tensor,
        noise: &Tensor,
        train: bool,
    ) -> Result<DiffusionOutput> {
        let (bsz, seq_len) = self.check_input(token_ids)?;
        self.check_timesteps(timesteps, bsz)?;
        if self.check_embeddings(noise, Some(bsz))?.1 != seq_len {
            return Err(Error::Config(format!(
                "noise of shape {:?} does not match the token ids {:?}",
                noise.size(),
                token_ids.size()
            )));
        }
        let noisy = tch::no_grad(|| {
            let word_embeddings = self.backbone.embed_words(token_ids);
            let type_embeddings = self.backbone.embed_types(type_ids);
            self.corrupt(&word_embeddings, &type_embeddings, timesteps, noise)
        });
        let xs =
            noisy + self.backbone.embed_positions(seq_len) + self.time_embed.forward(timesteps);
        let xs = self.backbone.normalize_embeddings(&xs);
        let mask = self.backbone.expand_mask(attention_mask);
        let hidden = self.backbone.encode(&xs, &mask, train);
        let logits = self.backbone.predict(&hidden);
        let loss = token_loss(&logits, token_ids);
        Ok(DiffusionOutput { loss, logits, timesteps: timesteps.shallow_clone() })
    }

    /// Evaluates the model at the lowest noise level, a sanity check that the
    /// pretrained weights were picked up.
    pub fn test_pretrained(
        &self,
        token_ids: &Tensor,
        type_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<DiffusionOutput> {
        self.forward(token_ids, type_ids, attention_mask, Some(0), false)
    }
}

impl<B: MaskedLmBackbone> Denoiser for DiffusionBert<B> {
    // Unconditional generation: every position attends to every other one and
    // uses token type 0.
    fn denoise(&self, noisy: &Tensor, timestep: usize) -> Result<Tensor> {
        self.check_timestep(timestep)?;
        let (bsz, seq_len) = self.check_embeddings(noisy, None)?;
        let options = (Kind::Int64, noisy.device());
        let timesteps = Tensor::full([bsz], timestep as i64, options);
        let type_ids = Tensor::zeros([bsz, seq_len], options);
        let attention_mask = Tensor::ones([bsz, seq_len], options);
        let xs = noisy
            + self.backbone.embed_positions(seq_len)
            + self.backbone.embed_types(&type_ids)
            + self.time_embed.forward(&timesteps);
        let xs = self.backbone.normalize_embeddings(&xs);
        let mask = self.backbone.expand_mask(&attention_mask);
        let hidden = self.backbone.encode(&xs, &mask, false);
        Ok(self.backbone.predict(&hidden))
    }

    // The soft estimate, probabilities times the word table, is used instead of
    // the embedding of the argmax token.
    fn expected_embedding(&self, logits: &Tensor) -> Tensor {
        logits.softmax(-1, Kind::Float).matmul(self.backbone.word_embedding_table())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedulers::ddim::DdimSampler;
    use crate::transformers::bert::tests::tiny_config;
    use crate::transformers::bert::Head;

    fn model(vs: &nn::VarStore, max_len: usize, max_step: usize) -> DiffusionBert {
        DiffusionBert::bert(&vs.root(), &tiny_config(), Head::PreTraining, max_len, max_step)
            .unwrap()
    }

    fn batch() -> (Tensor, Tensor, Tensor) {
        let ids = Tensor::from_slice(&[2i64, 7, 9, 12, 3, 0, 0, 0, 2, 30, 4, 5, 6, 8, 10, 3])
            .view((2, 8));
        let type_ids = Tensor::zeros([2, 8], (Kind::Int64, Device::Cpu));
        let mask = ids.ne(0).to_kind(Kind::Int64);
        (ids, type_ids, mask)
    }

    #[test]
    fn end_to_end_forward_at_lowest_noise() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs, 8, 10);
        let (ids, type_ids, mask) = batch();
        let out = model.forward(&ids, &type_ids, &mask, Some(0), false).unwrap();
        assert_eq!(out.logits.size(), vec![2, 8, 32]);
        let loss = out.loss.double_value(&[]);
        assert!(loss.is_finite() && loss > 0., "{loss}");
        assert_eq!(Vec::<i64>::try_from(&out.timesteps).unwrap(), vec![0, 0]);
    }

    #[test]
    fn pretrained_check_runs_at_the_lowest_noise() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs, 8, 10);
        let (ids, type_ids, mask) = batch();
        let out = model.test_pretrained(&ids, &type_ids, &mask).unwrap();
        let reference = model.forward(&ids, &type_ids, &mask, Some(0), false).unwrap();
        assert_eq!(out.logits.size(), reference.logits.size());
        assert!(out.timesteps.equal(&reference.timesteps));
        assert!(out.loss.double_value(&[]).is_finite());
    }

    #[test]
    fn sampled_timesteps_are_in_range() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs, 8, 10);
        let (ids, type_ids, mask) = batch();
        let out = model.forward(&ids, &type_ids, &mask, None, true).unwrap();
        for t in Vec::<i64>::try_from(&out.timesteps).unwrap() {
            assert!((0..10).contains(&t));
        }
    }

    #[test]
    fn forward_with_fixed_noise_is_deterministic() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs, 8, 10);
        let (ids, type_ids, mask) = batch();
        let timesteps = Tensor::from_slice(&[3i64, 3]);
        let noise = model.noise(2, 8);
        let a = model.forward_with_noise(&ids, &type_ids, &mask, &timesteps, &noise, false).unwrap();
        let b = model.forward_with_noise(&ids, &type_ids, &mask, &timesteps, &noise, false).unwrap();
        assert!(a.logits.equal(&b.logits));
        assert_eq!(a.loss.double_value(&[]), b.loss.double_value(&[]));
    }

    #[test]
    fn explicit_timesteps_and_noise_are_validated() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs, 8, 10);
        let (ids, type_ids, mask) = batch();
        let noise = model.noise(2, 8);
        let run = |timesteps: &Tensor, noise: &Tensor| {
            model.forward_with_noise(&ids, &type_ids, &mask, timesteps, noise, false)
        };
        for timesteps in [
            Tensor::from_slice(&[10i64, 10]),
            Tensor::from_slice(&[0i64, -1]),
            Tensor::from_slice(&[3i64]),
            Tensor::from_slice(&[3f32, 3.]),
        ] {
            assert!(matches!(run(&timesteps, &noise), Err(Error::Config(_))));
        }
        let timesteps = Tensor::from_slice(&[9i64, 0]);
        assert!(run(&timesteps, &noise).is_ok());
        assert!(matches!(run(&timesteps, &model.noise(2, 7)), Err(Error::Config(_))));
        assert!(matches!(run(&timesteps, &model.noise(1, 8)), Err(Error::Config(_))));
        let wide = Tensor::zeros([2, 8, 17], (Kind::Float, Device::Cpu));
        assert!(matches!(run(&timesteps, &wide), Err(Error::Config(_))));
    }

    #[test]
    fn denoise_rejects_malformed_embeddings() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs, 8, 10);
        let flat = Tensor::zeros([2, 16], (Kind::Float, Device::Cpu));
        assert!(matches!(model.denoise(&flat, 3), Err(Error::Config(_))));
        assert!(matches!(model.denoise(&model.noise(2, 9), 3), Err(Error::Config(_))));
        assert!(matches!(model.denoise(&model.noise(2, 8), 10), Err(Error::Config(_))));
        assert_eq!(model.denoise(&model.noise(2, 8), 3).unwrap().size(), vec![2, 8, 32]);
    }

    #[test]
    fn padding_only_batch_has_zero_loss() {
        let logits = Tensor::randn([2, 3, 5], (Kind::Float, Device::Cpu));
        let pads = Tensor::zeros([2, 3], (Kind::Int64, Device::Cpu));
        assert_eq!(token_loss(&logits, &pads).double_value(&[]), 0.);

        let targets = Tensor::from_slice(&[1i64, 4, 0, 2, 0, 0]).view((2, 3));
        let mean = logits.reshape([-1, 5]).cross_entropy_loss::<Tensor>(
            &targets.reshape([-1]),
            None,
            tch::Reduction::Mean,
            PAD_TOKEN_ID,
            0.,
        );
        let loss = token_loss(&logits, &targets).double_value(&[]);
        assert!((loss - mean.double_value(&[])).abs() < 1e-5, "{loss}");
    }

    #[test]
    fn corruption_at_the_extremes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs, 8, 10);
        let (ids, type_ids, _mask) = batch();
        let words = model.backbone().embed_words(&ids);
        let types = model.backbone().embed_types(&type_ids);
        let noise = model.noise(2, 8);

        let last = Tensor::from_slice(&[9i64, 9]);
        let noisy = model.corrupt(&words, &types, &last, &noise);
        assert!(noisy.allclose(&(&noise + &types), 1e-6, 1e-6, false));

        let vs = nn::VarStore::new(Device::Cpu);
        let model = self::model(&vs, 8, 100_000);
        let words = model.backbone().embed_words(&ids);
        let types = model.backbone().embed_types(&type_ids);
        let first = Tensor::from_slice(&[0i64, 0]);
        let noisy = model.corrupt(&words, &types, &first, &noise);
        let clean = &words + &types;
        let max_diff = (noisy - &clean).abs().max().double_value(&[]);
        assert!(max_diff < 0.1, "{max_diff}");
    }

    #[test]
    fn frozen_and_trainable_parameters() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs, 8, 10);
        let variables = vs.variables();
        for name in [
            "bert.embeddings.word_embeddings.weight",
            "bert.embeddings.token_type_embeddings.weight",
            "bert.pooler.dense.weight",
            "bert.pooler.dense.bias",
            "cls.seq_relationship.weight",
            "cls.seq_relationship.bias",
        ] {
            assert!(!variables[name].requires_grad(), "{name} should be frozen");
        }
        for name in [
            "time_embed.weight",
            "bert.embeddings.position_embeddings.weight",
            "bert.embeddings.LayerNorm.weight",
            "bert.encoder.layer.0.attention.self.query.weight",
        ] {
            assert!(variables[name].requires_grad(), "{name} should be trainable");
        }
        assert_eq!(model.time_embed().weight().abs().sum(Kind::Float).double_value(&[]), 0.);
    }

    #[test]
    fn gradients_skip_frozen_embeddings() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs, 8, 10);
        let (ids, type_ids, mask) = batch();
        let out = model.forward(&ids, &type_ids, &mask, None, true).unwrap();
        out.loss.backward();
        let variables = vs.variables();
        assert!(variables["time_embed.weight"].grad().defined());
        assert!(variables["bert.encoder.layer.1.output.dense.weight"].grad().defined());
        assert!(!variables["bert.embeddings.token_type_embeddings.weight"].grad().defined());
    }

    #[test]
    fn configuration_errors() {
        let vs = nn::VarStore::new(Device::Cpu);
        let too_long = DiffusionBert::bert(&vs.root(), &tiny_config(), Head::MaskedLm, 17, 10);
        assert!(matches!(too_long, Err(Error::Config(_))));
        let no_steps = DiffusionBert::bert(&vs.root(), &tiny_config(), Head::MaskedLm, 8, 0);
        assert!(matches!(no_steps, Err(Error::Config(_))));

        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs, 4, 10);
        let (ids, type_ids, mask) = batch();
        assert!(model.forward(&ids, &type_ids, &mask, Some(0), false).is_err());
        let ids = ids.narrow(1, 0, 4);
        let type_ids = type_ids.narrow(1, 0, 4);
        let mask = mask.narrow(1, 0, 4);
        assert!(matches!(
            model.forward(&ids, &type_ids, &mask, Some(10), false),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn single_step_sampling_matches_denoise() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs, 8, 10);
        let sampler = DdimSampler::new(*model.schedule(), 10).unwrap();
        let noise = model.noise(2, 8);
        let tokens = sampler.sample(&model, noise.shallow_clone()).unwrap();
        let direct = tch::no_grad(|| model.denoise(&noise, 9)).unwrap().argmax(-1, false);
        assert_eq!(tokens.size(), vec![2, 8]);
        assert!(tokens.equal(&direct));
    }

    #[test]
    fn sampling_from_the_same_noise_is_reproducible() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = model(&vs, 8, 10);
        let sampler = DdimSampler::new(*model.schedule(), 3).unwrap();
        let noise = model.noise(2, 8);
        let first = sampler.sample(&model, noise.shallow_clone()).unwrap();
        let second = sampler.sample(&model, noise).unwrap();
        assert!(first.equal(&second));
    }
}
