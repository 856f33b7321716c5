//! Draft-token sources for speculative decoding.

mod ngram;

pub use ngram::{NGramConfig, NGramProposer};

/// Proposes candidate continuations for the target model to verify.
///
/// Implementations range from a small draft model to the model-free
/// [`NGramProposer`]. Proposals are best-effort: an empty vector simply
/// degrades the step to ordinary single-token decoding.
pub trait DraftProposer: Send {
    /// Propose up to `max_tokens` continuation tokens for `token_ids`.
    fn propose(&self, token_ids: &[i32], max_tokens: usize) -> Vec<i32>;

    fn name(&self) -> &str {
        "draft"
    }
}
