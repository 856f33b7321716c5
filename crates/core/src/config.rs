//! Generation parameters and construction-time validation.

use serde::Deserialize;

use crate::error::GeneratorError;

/// Search-policy parameters. Immutable once a generation starts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    /// Number of beams per batch entry. 1 selects greedy/sampling.
    pub num_beams: usize,
    /// Total sequence length bound, prompt included.
    pub max_length: usize,
    /// EOS is masked out until the sequence reaches this length.
    pub min_length: usize,
    /// Sample stochastically instead of taking the argmax.
    pub do_sample: bool,
    /// Top-K filtering. 0 = disabled.
    pub top_k: usize,
    /// Nucleus sampling threshold in (0, 1]. 1.0 = full distribution.
    pub top_p: f32,
    /// Temperature for logit scaling. Must be positive.
    pub temperature: f32,
    /// Penalty for tokens already present in the sequence. 1.0 = none.
    pub repetition_penalty: f32,
    /// Length-normalization exponent for beam scores.
    pub length_penalty: f32,
    /// How many finished beams to return per batch entry.
    pub num_return_sequences: usize,
    /// Seed for the sampling RNG. None seeds from OS entropy.
    pub random_seed: Option<u64>,
    /// Alias past and present KV buffers in one allocation. Incompatible
    /// with beam search.
    pub past_present_share_buffer: bool,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            num_beams: 1,
            max_length: 128,
            min_length: 0,
            do_sample: false,
            top_k: 0,
            top_p: 1.0,
            temperature: 1.0,
            repetition_penalty: 1.0,
            length_penalty: 1.0,
            num_return_sequences: 1,
            random_seed: None,
            past_present_share_buffer: false,
        }
    }
}

/// Which sampler a greedy-family search runs each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SamplingKind {
    Greedy,
    TopK,
    TopP,
    TopKTopP,
}

impl SearchParams {
    pub(crate) fn sampling_kind(&self) -> SamplingKind {
        if !self.do_sample {
            SamplingKind::Greedy
        } else if self.top_k > 0 && self.top_p < 1.0 {
            SamplingKind::TopKTopP
        } else if self.top_k > 0 {
            SamplingKind::TopK
        } else {
            SamplingKind::TopP
        }
    }
}

/// Parameters for one generation. Created once, never mutated.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorParams {
    pub batch_size: usize,
    pub vocab_size: usize,
    pub eos_token_id: i32,
    pub pad_token_id: i32,
    pub search: SearchParams,
}

impl Default for GeneratorParams {
    fn default() -> Self {
        Self {
            batch_size: 1,
            vocab_size: 0,
            eos_token_id: 0,
            pad_token_id: 0,
            search: SearchParams::default(),
        }
    }
}

impl GeneratorParams {
    /// Number of sequence rows: `batch_size * num_beams`.
    pub fn batch_beam_size(&self) -> usize {
        self.batch_size * self.search.num_beams
    }

    /// Reject contradictory parameter combinations up front.
    pub fn validate(&self) -> Result<(), GeneratorError> {
        let invalid = |msg: String| Err(GeneratorError::ConfigInvalid(msg));

        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".into());
        }
        if self.vocab_size == 0 {
            return invalid("vocab_size must be at least 1".into());
        }
        if self.eos_token_id < 0 || self.eos_token_id as usize >= self.vocab_size {
            return invalid(format!(
                "eos_token_id {} outside vocabulary of size {}",
                self.eos_token_id, self.vocab_size
            ));
        }
        if self.pad_token_id < 0 {
            return invalid(format!("pad_token_id {} is negative", self.pad_token_id));
        }

        let search = &self.search;
        if search.max_length == 0 {
            return invalid("max_length must be at least 1".into());
        }
        if search.min_length > search.max_length {
            return invalid(format!(
                "min_length {} exceeds max_length {}",
                search.min_length, search.max_length
            ));
        }
        if search.num_beams == 0 {
            return invalid("num_beams must be at least 1".into());
        }
        if search.num_beams > 1 && search.do_sample {
            return invalid("num_beams > 1 cannot be combined with sampling".into());
        }
        if search.num_return_sequences == 0 || search.num_return_sequences > search.num_beams {
            return invalid(format!(
                "num_return_sequences {} must be in 1..={}",
                search.num_return_sequences, search.num_beams
            ));
        }
        if !(search.temperature > 0.0) || !search.temperature.is_finite() {
            return invalid(format!("temperature {} must be positive", search.temperature));
        }
        if !(search.top_p > 0.0) || search.top_p > 1.0 {
            return invalid(format!("top_p {} must be in (0, 1]", search.top_p));
        }
        if !(search.repetition_penalty > 0.0) {
            return invalid(format!(
                "repetition_penalty {} must be positive",
                search.repetition_penalty
            ));
        }
        if !search.length_penalty.is_finite() {
            return invalid(format!(
                "length_penalty {} must be finite",
                search.length_penalty
            ));
        }
        if search.past_present_share_buffer && search.num_beams > 1 {
            return invalid("past_present_share_buffer is incompatible with beam search".into());
        }
        Ok(())
    }
}
