//! Score shaping and token sampling.
//!
//! Shaping operations mutate one row's `[vocab]` score window in place.
//! Samplers consume the shaped window and draw a single token. All randomness
//! flows through [`SamplerState`] so a fixed seed replays identically.

use std::cmp::Ordering;
use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Mutable sampling state: the seeded RNG owned by a search.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    /// `None` seeds from OS entropy; `Some(seed)` replays deterministically.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Uniform draw in `[0, bound)`.
    pub(crate) fn next_uniform(&mut self, bound: f32) -> f32 {
        self.rng.gen::<f32>() * bound
    }
}

/// Stable softmax with temperature, in place. `temperature` must be positive.
pub fn softmax(scores: &mut [f32], temperature: f32) {
    let inv_temp = 1.0 / temperature;
    for s in scores.iter_mut() {
        *s *= inv_temp;
    }
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for s in scores.iter_mut() {
            *s *= inv_sum;
        }
    }
}

/// Stable log-softmax in place:
/// `x_i - max(x) - ln(sum(exp(x_j - max(x))))`.
pub fn log_softmax(scores: &mut [f32]) {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum_exp = scores.iter().map(|&s| (s - max).exp()).sum::<f32>().ln();
    for s in scores.iter_mut() {
        *s = *s - max - log_sum_exp;
    }
}

/// Mask the EOS column of one row (min-length enforcement).
pub(crate) fn mask_eos(scores: &mut [f32], eos_token_id: i32) {
    let idx = eos_token_id as usize;
    if idx < scores.len() {
        scores[idx] = f32::NEG_INFINITY;
    }
}

/// Penalize every token id already present in `sequence`.
///
/// Negative scores are multiplied, positive scores divided. This assumes a
/// row's scores are wholly positive or wholly negative; mixed signs give
/// model-dependent results.
pub(crate) fn apply_repetition_penalty(scores: &mut [f32], sequence: &[i32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let unique_ids: HashSet<i32> = sequence.iter().copied().collect();
    for id in unique_ids {
        let idx = id as usize;
        if idx < scores.len() {
            let score = scores[idx];
            scores[idx] = if score < 0.0 {
                score * penalty
            } else {
                score / penalty
            };
        }
    }
}

/// Replace a NaN-poisoned row with a distribution that can only produce
/// `pad_token_id`. Returns whether scrubbing happened.
pub(crate) fn scrub_nan(scores: &mut [f32], pad_token_id: i32) -> bool {
    if !scores.iter().any(|s| s.is_nan()) {
        return false;
    }
    scores.fill(f32::NEG_INFINITY);
    let idx = pad_token_id as usize;
    if idx < scores.len() {
        scores[idx] = 0.0;
    }
    true
}

/// Argmax with ties broken toward the lowest index.
pub(crate) fn argmax(scores: &[f32]) -> i32 {
    let mut best = 0usize;
    for (idx, &score) in scores.iter().enumerate().skip(1) {
        if score > scores[best] {
            best = idx;
        }
    }
    best as i32
}

fn compare_desc(scores: &[f32], a: usize, b: usize) -> Ordering {
    scores[b]
        .partial_cmp(&scores[a])
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.cmp(&b))
}

/// Indices of the `k` highest scores, ordered descending (ties by index).
fn partial_top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    let k = k.min(indices.len());
    if k < indices.len() {
        indices.select_nth_unstable_by(k - 1, |&a, &b| compare_desc(scores, a, b));
        indices.truncate(k);
    }
    indices.sort_unstable_by(|&a, &b| compare_desc(scores, a, b));
    indices
}

fn sorted_indices_desc(scores: &[f32]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_unstable_by(|&a, &b| compare_desc(scores, a, b));
    indices
}

/// Inverse-CDF walk over probabilities in `order`: subtract each probability
/// from `threshold` and return the first index driving it non-positive.
pub(crate) fn top_p_walk(order: &[usize], probs: &[f32], mut threshold: f32, fallback: usize) -> i32 {
    for &idx in order {
        threshold -= probs[idx];
        if threshold <= 0.0 {
            return idx as i32;
        }
    }
    fallback as i32
}

/// Sample among the `k` highest-probability tokens, each weighted by its
/// (unnormalized) probability. Mutates `scores` into the softmax distribution.
pub(crate) fn sample_top_k(
    scores: &mut [f32],
    k: usize,
    temperature: f32,
    state: &mut SamplerState,
) -> i32 {
    softmax(scores, temperature);
    let top = partial_top_k(scores, k);
    let total: f32 = top.iter().map(|&i| scores[i]).sum();
    let mut remaining = state.next_uniform(total);
    let mut chosen = *top.last().unwrap_or(&0);
    for &idx in &top {
        remaining -= scores[idx];
        if remaining <= 0.0 {
            chosen = idx;
            break;
        }
    }
    chosen as i32
}

/// Nucleus sampling: draw `threshold ~ U(0, p)` and walk the full sorted
/// distribution. Mutates `scores` into the softmax distribution.
pub(crate) fn sample_top_p(
    scores: &mut [f32],
    p: f32,
    temperature: f32,
    state: &mut SamplerState,
) -> i32 {
    softmax(scores, temperature);
    let order = sorted_indices_desc(scores);
    let threshold = state.next_uniform(p);
    top_p_walk(&order, scores, threshold, 0)
}

/// Restrict to the top `k` tokens, then run the nucleus walk over them. When
/// no prefix crosses the threshold the k-th token is returned.
pub(crate) fn sample_top_k_top_p(
    scores: &mut [f32],
    k: usize,
    p: f32,
    temperature: f32,
    state: &mut SamplerState,
) -> i32 {
    softmax(scores, temperature);
    let top = partial_top_k(scores, k);
    let threshold = state.next_uniform(p);
    let fallback = *top.last().unwrap_or(&0);
    top_p_walk(&top, scores, threshold, fallback)
}
