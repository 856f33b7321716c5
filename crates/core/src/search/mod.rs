//! Search policies: greedy/sampling, beam, and speculative verification.
//!
//! The policies share a [`SearchCore`] (params handle, sequence store, done
//! flag) by composition and are dispatched through the [`Search`] enum; there
//! is no trait hierarchy.

mod beam;
mod greedy;
mod speculative;

pub use beam::{BeamScorer, BeamSearch};
pub use greedy::{GreedySearch, RowState};
pub use speculative::SpeculativeSearch;

use std::sync::Arc;

use crate::config::GeneratorParams;
use crate::error::GeneratorError;
use crate::sampling;
use crate::sequences::Sequences;

/// State shared by every search policy.
pub(crate) struct SearchCore {
    pub(crate) params: Arc<GeneratorParams>,
    pub(crate) sequences: Sequences,
    pub(crate) done: bool,
}

impl SearchCore {
    pub(crate) fn new(params: Arc<GeneratorParams>, sequences: Sequences) -> Self {
        Self {
            params,
            sequences,
            done: false,
        }
    }

    /// Mask EOS in every row while the sequence is below the minimum length.
    pub(crate) fn apply_min_length(&self, scores: &mut [f32]) {
        if self.sequences.len() >= self.params.search.min_length {
            return;
        }
        for window in scores.chunks_mut(self.params.vocab_size) {
            sampling::mask_eos(window, self.params.eos_token_id);
        }
    }

    /// Penalize each row's already-generated tokens.
    pub(crate) fn apply_repetition_penalty(&self, scores: &mut [f32]) {
        let penalty = self.params.search.repetition_penalty;
        if penalty == 1.0 {
            return;
        }
        for (row, window) in scores.chunks_mut(self.params.vocab_size).enumerate() {
            sampling::apply_repetition_penalty(window, self.sequences.sequence(row), penalty);
        }
    }
}

/// Tagged dispatch over the concrete search policies.
pub enum Search {
    Greedy(GreedySearch),
    Beam(BeamSearch),
    Speculative(SpeculativeSearch),
}

impl Search {
    pub(crate) fn core(&self) -> &SearchCore {
        match self {
            Search::Greedy(s) => s.core(),
            Search::Beam(s) => s.core(),
            Search::Speculative(s) => s.inner().core(),
        }
    }

    pub(crate) fn core_mut(&mut self) -> &mut SearchCore {
        match self {
            Search::Greedy(s) => s.core_mut(),
            Search::Beam(s) => s.core_mut(),
            Search::Speculative(s) => s.inner_mut().core_mut(),
        }
    }

    pub(crate) fn sequences(&self) -> &Sequences {
        &self.core().sequences
    }

    pub(crate) fn is_done(&self) -> bool {
        match self {
            Search::Greedy(s) => s.is_done(),
            Search::Beam(s) => s.is_done(),
            Search::Speculative(s) => s.inner().is_done(),
        }
    }

    /// Run one policy step over the shaped `[batch_beam, vocab]` window:
    /// select tokens (and beam indices) and append them to the sequences.
    pub(crate) fn select_next(&mut self, scores: &mut [f32]) -> Result<(), GeneratorError> {
        match self {
            Search::Greedy(s) => s.select_next(scores),
            Search::Beam(s) => s.select_next(scores),
            Search::Speculative(s) => s.inner_mut().select_next(scores),
        }
    }

    /// Tokens chosen by the last step, one per batch-beam row.
    pub(crate) fn next_tokens(&self) -> &[i32] {
        match self {
            Search::Greedy(s) => s.next_tokens(),
            Search::Beam(s) => s.next_tokens(),
            Search::Speculative(s) => s.inner().next_tokens(),
        }
    }

    /// Beam reorder map from the last step, when the policy produces one.
    pub(crate) fn next_indices(&self) -> Option<&[i32]> {
        match self {
            Search::Beam(s) => Some(s.next_indices()),
            _ => None,
        }
    }
}
