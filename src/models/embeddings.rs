use tch::{nn, nn::Module, Tensor};

/// A learned embedding per diffusion timestep.
///
/// The table starts at zero so that a freshly initialized model sees the
/// pretrained encoder inputs unchanged.
#[derive(Debug)]
pub struct TimestepEmbedding {
    embedding: nn::Embedding,
}

impl TimestepEmbedding {
    pub fn new(vs: nn::Path, max_step: i64, hidden_size: i64) -> Self {
        let config = nn::EmbeddingConfig { ws_init: nn::Init::Const(0.), ..Default::default() };
        let embedding = nn::embedding(vs, max_step, hidden_size, config);
        Self { embedding }
    }

    pub fn weight(&self) -> &Tensor {
        &self.embedding.ws
    }
}

impl Module for TimestepEmbedding {
    /// Maps `(batch,)` timesteps to `(batch, 1, hidden_size)`, ready to be
    /// broadcast over the sequence positions.
    fn forward(&self, timesteps: &Tensor) -> Tensor {
        self.embedding.forward(timesteps).unsqueeze(1)
    }
}
