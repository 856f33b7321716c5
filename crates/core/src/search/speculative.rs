//! Draft verification for speculative decoding.
//!
//! Wraps the greedy search: each draft position is shaped and argmaxed
//! against the target logits, accepted tokens append through the usual EOS
//! bookkeeping, and the first mismatch ends the round with the model's own
//! token in place of the rejected draft token.

use std::sync::Arc;

use tracing::debug;

use crate::config::GeneratorParams;
use crate::error::GeneratorError;
use crate::logits::Logits;
use crate::sampling;
use crate::search::greedy::GreedySearch;
use crate::sequences::Sequences;

pub struct SpeculativeSearch {
    inner: GreedySearch,
}

impl SpeculativeSearch {
    pub(crate) fn new(params: Arc<GeneratorParams>, sequences: Sequences) -> Self {
        Self {
            inner: GreedySearch::new(params, sequences),
        }
    }

    pub(crate) fn inner(&self) -> &GreedySearch {
        &self.inner
    }

    pub(crate) fn inner_mut(&mut self) -> &mut GreedySearch {
        &mut self.inner
    }

    /// Verify `draft` against the target logits window.
    ///
    /// `base_position` is the window position predicting the token after the
    /// current sequence; the window must extend `draft.len()` positions
    /// beyond it. Returns how many tokens were appended: every matching
    /// draft token plus the model's own extension or replacement.
    pub(crate) fn check_candidates(
        &mut self,
        logits: &mut Logits,
        draft: &[i32],
        base_position: usize,
    ) -> Result<usize, GeneratorError> {
        let params = self.inner.core().params.clone();
        let candidate_length = draft.len();
        let mut accepted = 0;

        for logit_index in 0..=candidate_length {
            let window = logits.position_window(base_position + logit_index);
            if self.inner.core().sequences.len() < params.search.min_length {
                sampling::mask_eos(window, params.eos_token_id);
            }
            sampling::apply_repetition_penalty(
                window,
                self.inner.core().sequences.sequence(0),
                params.search.repetition_penalty,
            );

            let token = sampling::argmax(window);
            self.inner.set_next_token(0, token);
            self.inner.append_next_tokens()?;
            accepted = logit_index + 1;

            if self.inner.is_done()
                || logit_index == candidate_length
                || draft[logit_index] != token
            {
                break;
            }
        }

        debug!(accepted, candidate_length, "draft verification finished");
        Ok(accepted)
    }
}
