//! Model capability consumed by the generation loop.
//!
//! The core never executes a network itself. It fills a [`StepContext`] with
//! input bindings, hands it to a [`ModelBackend`], and reads the logits and
//! present-KV outputs back out. Backends must not retain tensor references
//! across calls.

use candle_core::{DType, Device, Tensor};

pub use crate::error::BackendError;

/// Per-layer KV tensor geometry declared by a backend. The cache validates
/// every produced tensor against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvSignature {
    pub layer_count: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

/// One layer's key/value tensor pair, shape `[batch_beam, heads, seq, dim]`.
///
/// Cloning shares the underlying storage.
#[derive(Debug, Clone)]
pub struct KvLayer {
    pub key: Tensor,
    pub value: Tensor,
}

/// Input/output binding slots for a single model call.
///
/// Sub-components borrow this for the duration of one step only: the KV cache
/// binds `past` (and `cross`), the backend writes `logits` and `present`.
pub struct StepContext {
    /// Token window, row-major `[batch_beam, token_count]`.
    pub input_ids: Vec<i32>,
    /// Tokens per row in this step's window.
    pub token_count: usize,
    /// Sequence positions already covered by `past`; also the position id of
    /// the window's first token.
    pub past_length: usize,
    pub batch_beam_size: usize,
    /// Attention mask over `past_length + token_count` positions per row.
    pub attention_mask: Vec<i32>,
    /// Per-layer past KV. Empty on the first step.
    pub past: Vec<KvLayer>,
    /// Encoder cross-attention KV, read-only. Empty for decoder-only models.
    pub cross: Vec<KvLayer>,
    /// Backend output: logits `[batch_beam, token_count, vocab]`.
    pub logits: Option<Tensor>,
    /// Backend output: per-layer present KV covering
    /// `past_length + token_count` positions. Left empty by shared-buffer
    /// backends, which write into `past` in place.
    pub present: Vec<KvLayer>,
}

impl StepContext {
    pub(crate) fn new(
        input_ids: Vec<i32>,
        token_count: usize,
        past_length: usize,
        batch_beam_size: usize,
    ) -> Self {
        debug_assert_eq!(input_ids.len(), batch_beam_size * token_count);
        Self {
            input_ids,
            token_count,
            past_length,
            batch_beam_size,
            attention_mask: vec![1; batch_beam_size * (past_length + token_count)],
            past: Vec::new(),
            cross: Vec::new(),
            logits: None,
            present: Vec::new(),
        }
    }
}

/// Synchronous model execution capability.
///
/// `run` consumes the bound inputs and fills the output slots. How the
/// network executes (ONNX, CUDA graphs, plain candle ops) is opaque to the
/// generation core; the only contract is the declared dtypes and KV geometry.
pub trait ModelBackend {
    fn run(&mut self, ctx: &mut StepContext) -> Result<(), BackendError>;

    /// Dtype of the logits tensor `run` produces.
    fn logits_dtype(&self) -> DType;

    /// Dtype of the KV tensors `run` produces.
    fn kv_dtype(&self) -> DType;

    fn kv_signature(&self) -> KvSignature;

    fn device(&self) -> &Device;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_context_sizes_attention_mask() {
        let ctx = StepContext::new(vec![1, 2, 3, 4], 2, 3, 2);
        assert_eq!(ctx.attention_mask.len(), 2 * (3 + 2));
        assert!(ctx.attention_mask.iter().all(|&m| m == 1));
        assert!(ctx.past.is_empty());
        assert!(ctx.logits.is_none());
    }
}
