//! Bidirectional Encoder Representations from Transformers
//!
//! BERT is a transformer encoder pretrained with a masked language modeling
//! objective, and optionally a next sentence prediction objective.
//!
//! https://arxiv.org/abs/1810.04805
//!
//! Variable names follow the Hugging Face implementation so that converted
//! checkpoints can be loaded directly.
//! https://github.com/huggingface/transformers/blob/main/src/transformers/models/bert/modeling_bert.py
use super::MaskedLmBackbone;
use serde::Deserialize;
use std::path::Path;
use tch::{nn, nn::Module, Device, Kind, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Gelu,
    GeluNew,
    Relu,
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            Activation::Gelu => xs.gelu("none"),
            Activation::GeluNew => xs.gelu("tanh"),
            Activation::Relu => xs.relu(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vocab_size: i64,
    pub hidden_size: i64,
    pub num_hidden_layers: i64,
    pub num_attention_heads: i64,
    pub intermediate_size: i64,
    pub hidden_act: Activation,
    pub hidden_dropout_prob: f64,
    pub attention_probs_dropout_prob: f64,
    pub max_position_embeddings: i64,
    pub type_vocab_size: i64,
    pub layer_norm_eps: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self::bert_base_uncased()
    }
}

impl Config {
    // https://huggingface.co/bert-base-uncased/blob/main/config.json
    pub fn bert_base_uncased() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: Activation::Gelu,
            hidden_dropout_prob: 0.1,
            attention_probs_dropout_prob: 0.1,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
        }
    }

    // https://huggingface.co/prajjwal1/bert-mini/blob/main/config.json
    pub fn bert_mini() -> Self {
        Self {
            hidden_size: 256,
            num_hidden_layers: 4,
            num_attention_heads: 4,
            intermediate_size: 1024,
            ..Self::bert_base_uncased()
        }
    }

    /// Reads a Hugging Face `config.json`, missing fields take their
    /// `bert-base-uncased` value.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = crate::utils::file_open(path)?;
        let config = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }
}

/// Which pretraining heads come with the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Head {
    /// Only the masked language modeling head.
    MaskedLm,
    /// Masked language modeling plus the pooler and next sentence prediction.
    PreTraining,
}

impl Head {
    /// `bert-base` checkpoints are used through their masked LM head, others
    /// are loaded with the full pretraining heads.
    pub fn for_model_name(name: &str) -> Self {
        if name.contains("bert-base") {
            Head::MaskedLm
        } else {
            Head::PreTraining
        }
    }
}

fn layer_norm(vs: nn::Path, c: &Config) -> nn::LayerNorm {
    let config = nn::LayerNormConfig { eps: c.layer_norm_eps, ..Default::default() };
    nn::layer_norm(vs, vec![c.hidden_size], config)
}

#[derive(Debug)]
struct BertEmbeddings {
    word_embeddings: nn::Embedding,
    position_embeddings: nn::Embedding,
    token_type_embeddings: nn::Embedding,
    layer_norm: nn::LayerNorm,
}

impl BertEmbeddings {
    fn new(vs: nn::Path, c: &Config) -> Self {
        let word_embeddings =
            nn::embedding(&vs / "word_embeddings", c.vocab_size, c.hidden_size, Default::default());
        let position_embeddings = nn::embedding(
            &vs / "position_embeddings",
            c.max_position_embeddings,
            c.hidden_size,
            Default::default(),
        );
        let token_type_embeddings = nn::embedding(
            &vs / "token_type_embeddings",
            c.type_vocab_size,
            c.hidden_size,
            Default::default(),
        );
        let layer_norm = layer_norm(&vs / "LayerNorm", c);
        BertEmbeddings { word_embeddings, position_embeddings, token_type_embeddings, layer_norm }
    }
}

#[derive(Debug)]
struct BertSelfAttention {
    query: nn::Linear,
    key: nn::Linear,
    value: nn::Linear,
    num_attention_heads: i64,
    head_dim: i64,
    scale: f64,
    dropout: f64,
}

impl BertSelfAttention {
    fn new(vs: nn::Path, c: &Config) -> Self {
        let hidden = c.hidden_size;
        let query = nn::linear(&vs / "query", hidden, hidden, Default::default());
        let key = nn::linear(&vs / "key", hidden, hidden, Default::default());
        let value = nn::linear(&vs / "value", hidden, hidden, Default::default());
        let head_dim = hidden / c.num_attention_heads;
        let scale = (head_dim as f64).powf(-0.5);
        BertSelfAttention {
            query,
            key,
            value,
            num_attention_heads: c.num_attention_heads,
            head_dim,
            scale,
            dropout: c.attention_probs_dropout_prob,
        }
    }

    // (bsz, seq_len, hidden) -> (bsz, heads, seq_len, head_dim)
    fn shape(&self, xs: &Tensor, bsz: i64) -> Tensor {
        xs.view((bsz, -1, self.num_attention_heads, self.head_dim)).transpose(1, 2)
    }

    fn forward_t(&self, xs: &Tensor, mask: &Tensor, train: bool) -> Tensor {
        let size = xs.size();
        let (bsz, seq_len, hidden) = (size[0], size[1], size[2]);
        let query_states = self.shape(&xs.apply(&self.query), bsz);
        let key_states = self.shape(&xs.apply(&self.key), bsz);
        let value_states = self.shape(&xs.apply(&self.value), bsz);
        let attn_weights = query_states.matmul(&key_states.transpose(-1, -2)) * self.scale + mask;
        let attn_weights = attn_weights.softmax(-1, Kind::Float).dropout(self.dropout, train);
        attn_weights.matmul(&value_states).transpose(1, 2).contiguous().view((
            bsz,
            seq_len,
            hidden,
        ))
    }
}

#[derive(Debug)]
struct BertLayer {
    self_attn: BertSelfAttention,
    attention_dense: nn::Linear,
    attention_layer_norm: nn::LayerNorm,
    intermediate: nn::Linear,
    output_dense: nn::Linear,
    output_layer_norm: nn::LayerNorm,
    activation: Activation,
    dropout: f64,
}

impl BertLayer {
    fn new(vs: nn::Path, c: &Config) -> Self {
        let attention = &vs / "attention";
        let self_attn = BertSelfAttention::new(&attention / "self", c);
        let attention_dense = nn::linear(
            &attention / "output" / "dense",
            c.hidden_size,
            c.hidden_size,
            Default::default(),
        );
        let attention_layer_norm = layer_norm(&attention / "output" / "LayerNorm", c);
        let intermediate = nn::linear(
            &vs / "intermediate" / "dense",
            c.hidden_size,
            c.intermediate_size,
            Default::default(),
        );
        let output_dense = nn::linear(
            &vs / "output" / "dense",
            c.intermediate_size,
            c.hidden_size,
            Default::default(),
        );
        let output_layer_norm = layer_norm(&vs / "output" / "LayerNorm", c);
        BertLayer {
            self_attn,
            attention_dense,
            attention_layer_norm,
            intermediate,
            output_dense,
            output_layer_norm,
            activation: c.hidden_act,
            dropout: c.hidden_dropout_prob,
        }
    }

    // Post layer-norm residual blocks.
    fn forward_t(&self, xs: &Tensor, mask: &Tensor, train: bool) -> Tensor {
        let attn = self.self_attn.forward_t(xs, mask, train);
        let attn = attn.apply(&self.attention_dense).dropout(self.dropout, train);
        let xs = (attn + xs).apply(&self.attention_layer_norm);

        let ys = self.activation.forward(&xs.apply(&self.intermediate));
        let ys = ys.apply(&self.output_dense).dropout(self.dropout, train);
        (ys + xs).apply(&self.output_layer_norm)
    }
}

#[derive(Debug)]
struct BertEncoder {
    layers: Vec<BertLayer>,
}

impl BertEncoder {
    fn new(vs: nn::Path, c: &Config) -> Self {
        let vs = &vs / "layer";
        let layers = (0..c.num_hidden_layers).map(|index| BertLayer::new(&vs / index, c)).collect();
        BertEncoder { layers }
    }

    fn forward_t(&self, xs: &Tensor, mask: &Tensor, train: bool) -> Tensor {
        let mut xs = xs.shallow_clone();
        for layer in self.layers.iter() {
            xs = layer.forward_t(&xs, mask, train)
        }
        xs
    }
}

/// The masked language modeling head, the decoder weights are tied to the
/// word embeddings.
#[derive(Debug)]
struct BertLmPredictionHead {
    dense: nn::Linear,
    layer_norm: nn::LayerNorm,
    activation: Activation,
    bias: Tensor,
}

impl BertLmPredictionHead {
    fn new(vs: nn::Path, c: &Config) -> Self {
        let transform = &vs / "transform";
        let dense =
            nn::linear(&transform / "dense", c.hidden_size, c.hidden_size, Default::default());
        let layer_norm = layer_norm(&transform / "LayerNorm", c);
        let bias = vs.zeros("bias", &[c.vocab_size]);
        BertLmPredictionHead { dense, layer_norm, activation: c.hidden_act, bias }
    }

    fn forward(&self, xs: &Tensor, word_embeddings: &Tensor) -> Tensor {
        let xs = self.activation.forward(&xs.apply(&self.dense)).apply(&self.layer_norm);
        xs.matmul(&word_embeddings.tr()) + &self.bias
    }
}

/// A BERT encoder with its pretraining heads, `pooler` and `seq_relationship`
/// are only built for [`Head::PreTraining`] so that such checkpoints load
/// without leftovers.
#[derive(Debug)]
pub struct BertModel {
    embeddings: BertEmbeddings,
    encoder: BertEncoder,
    pooler: Option<nn::Linear>,
    predictions: BertLmPredictionHead,
    seq_relationship: Option<nn::Linear>,
    config: Config,
    head: Head,
}

impl BertModel {
    pub fn new(vs: &nn::Path, c: &Config, head: Head) -> Self {
        let bert = vs / "bert";
        let cls = vs / "cls";
        let embeddings = BertEmbeddings::new(&bert / "embeddings", c);
        let encoder = BertEncoder::new(&bert / "encoder", c);
        let predictions = BertLmPredictionHead::new(&cls / "predictions", c);
        let (pooler, seq_relationship) = match head {
            Head::MaskedLm => (None, None),
            Head::PreTraining => {
                let pooler = nn::linear(
                    &bert / "pooler" / "dense",
                    c.hidden_size,
                    c.hidden_size,
                    Default::default(),
                );
                let seq_relationship =
                    nn::linear(&cls / "seq_relationship", c.hidden_size, 2, Default::default());
                (Some(pooler), Some(seq_relationship))
            }
        };
        BertModel {
            embeddings,
            encoder,
            pooler,
            predictions,
            seq_relationship,
            config: c.clone(),
            head,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn head(&self) -> Head {
        self.head
    }
}

impl MaskedLmBackbone for BertModel {
    fn hidden_size(&self) -> i64 {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> i64 {
        self.config.vocab_size
    }

    fn max_position_embeddings(&self) -> i64 {
        self.config.max_position_embeddings
    }

    fn device(&self) -> Device {
        self.embeddings.word_embeddings.ws.device()
    }

    fn word_embedding_table(&self) -> &Tensor {
        &self.embeddings.word_embeddings.ws
    }

    fn embed_words(&self, token_ids: &Tensor) -> Tensor {
        self.embeddings.word_embeddings.forward(token_ids)
    }

    fn embed_types(&self, type_ids: &Tensor) -> Tensor {
        self.embeddings.token_type_embeddings.forward(type_ids)
    }

    fn embed_positions(&self, seq_len: i64) -> Tensor {
        let position_ids = Tensor::arange(seq_len, (Kind::Int64, self.device())).unsqueeze(0);
        self.embeddings.position_embeddings.forward(&position_ids)
    }

    fn normalize_embeddings(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.embeddings.layer_norm)
    }

    fn encode(&self, xs: &Tensor, mask: &Tensor, train: bool) -> Tensor {
        self.encoder.forward_t(xs, mask, train)
    }

    fn predict(&self, hidden: &Tensor) -> Tensor {
        self.predictions.forward(hidden, &self.embeddings.word_embeddings.ws)
    }

    // https://github.com/huggingface/transformers/blob/main/src/transformers/modeling_utils.py
    // get_extended_attention_mask, for a 2D padding mask.
    fn expand_mask(&self, mask: &Tensor) -> Tensor {
        let mask = mask.to_kind(Kind::Float).unsqueeze(1).unsqueeze(2);
        (1. - mask) * f32::MIN as f64
    }

    fn frozen_parameters(&self) -> Vec<Tensor> {
        let mut frozen = vec![
            self.embeddings.token_type_embeddings.ws.shallow_clone(),
            self.embeddings.word_embeddings.ws.shallow_clone(),
        ];
        for linear in [&self.pooler, &self.seq_relationship].into_iter().flatten() {
            frozen.push(linear.ws.shallow_clone());
            if let Some(bs) = &linear.bs {
                frozen.push(bs.shallow_clone())
            }
        }
        frozen
    }
}
