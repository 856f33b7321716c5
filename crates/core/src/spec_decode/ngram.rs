//! N-gram draft proposer.
//!
//! Finds the longest suffix of the sequence (bounded by `max_n`) that also
//! occurs earlier in the same sequence, and proposes the tokens that followed
//! that earlier occurrence. Pure CPU, no model required.

use super::DraftProposer;

#[derive(Debug, Clone)]
pub struct NGramConfig {
    /// Shortest suffix worth matching.
    pub min_n: usize,
    /// Longest suffix considered.
    pub max_n: usize,
    /// Cap on proposed tokens per call.
    pub max_draft_tokens: usize,
}

impl Default for NGramConfig {
    fn default() -> Self {
        Self {
            min_n: 1,
            max_n: 4,
            max_draft_tokens: 5,
        }
    }
}

#[derive(Debug)]
pub struct NGramProposer {
    config: NGramConfig,
}

impl NGramProposer {
    pub fn new(config: NGramConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(NGramConfig::default())
    }
}

impl DraftProposer for NGramProposer {
    fn propose(&self, token_ids: &[i32], max_tokens: usize) -> Vec<i32> {
        let budget = max_tokens.min(self.config.max_draft_tokens);
        find_suffix_continuation(token_ids, self.config.min_n, self.config.max_n, budget)
    }

    fn name(&self) -> &str {
        "ngram"
    }
}

/// Longest suffix of length in `[min_n, max_n]` matching an earlier window;
/// returns up to `budget` tokens following the earliest such occurrence.
fn find_suffix_continuation(
    token_ids: &[i32],
    min_n: usize,
    max_n: usize,
    budget: usize,
) -> Vec<i32> {
    let total = token_ids.len();
    if budget == 0 || total < min_n + 1 {
        return Vec::new();
    }

    let longest = max_n.min(total - 1);
    for n in (min_n..=longest).rev() {
        let suffix = &token_ids[total - n..];
        for start in 0..total - n {
            if &token_ids[start..start + n] == suffix {
                let follow = start + n;
                let take = budget.min(total - follow);
                return token_ids[follow..follow + take].to_vec();
            }
        }
    }
    Vec::new()
}
