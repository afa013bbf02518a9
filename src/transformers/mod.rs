//! # Transformers
//!
//! The denoising network only needs a handful of capabilities from the
//! pretrained encoder, these are captured by [`MaskedLmBackbone`] so that the
//! diffusion code does not depend on the encoder internals.
use tch::{Device, Tensor};

pub mod bert;

/// A pretrained masked language model split in its embedding lookups, its
/// encoder stack and its prediction head.
pub trait MaskedLmBackbone {
    fn hidden_size(&self) -> i64;

    fn vocab_size(&self) -> i64;

    /// The longest sequence the position embeddings support.
    fn max_position_embeddings(&self) -> i64;

    fn device(&self) -> Device;

    /// The word embedding table, shape `(vocab_size, hidden_size)`.
    fn word_embedding_table(&self) -> &Tensor;

    fn embed_words(&self, token_ids: &Tensor) -> Tensor;

    fn embed_types(&self, type_ids: &Tensor) -> Tensor;

    /// Position embeddings for the first `seq_len` positions, shape
    /// `(1, seq_len, hidden_size)`.
    fn embed_positions(&self, seq_len: i64) -> Tensor;

    /// The normalization applied to the summed embeddings before the encoder.
    fn normalize_embeddings(&self, xs: &Tensor) -> Tensor;

    /// Runs the encoder stack, `mask` is the output of
    /// [`MaskedLmBackbone::expand_mask`].
    fn encode(&self, xs: &Tensor, mask: &Tensor, train: bool) -> Tensor;

    /// Projects hidden states to vocabulary logits.
    fn predict(&self, hidden: &Tensor) -> Tensor;

    /// Turns a `(batch, seq_len)` mask of ones and zeros into the additive mask
    /// expected by [`MaskedLmBackbone::encode`].
    fn expand_mask(&self, mask: &Tensor) -> Tensor;

    /// Parameters that must not receive gradient updates.
    fn frozen_parameters(&self) -> Vec<Tensor>;
}
