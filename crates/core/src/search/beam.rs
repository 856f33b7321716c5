//! Beam search: per-batch hypothesis pools and top-2K candidate selection.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::config::GeneratorParams;
use crate::error::GeneratorError;
use crate::sampling;
use crate::search::SearchCore;
use crate::sequences::Sequences;

/// Live beams start from one real root; the rest are pushed far down so the
/// first step expands distinct tokens instead of K copies of the same one.
const INACTIVE_BEAM_SCORE: f32 = -1e9;

#[derive(Debug, Clone)]
struct HypothesisScore {
    tokens: Vec<i32>,
    /// Length-normalized score: `sum_logprobs / len^length_penalty`.
    score: f32,
}

/// Bounded pool of completed hypotheses for one batch entry, kept sorted
/// worst-first.
#[derive(Debug)]
struct BeamHypotheses {
    beams: Vec<HypothesisScore>,
    num_beams: usize,
    length_penalty: f32,
    done: bool,
}

impl BeamHypotheses {
    fn new(num_beams: usize, length_penalty: f32) -> Self {
        Self {
            beams: Vec::with_capacity(num_beams + 1),
            num_beams,
            length_penalty,
            done: false,
        }
    }

    fn add(&mut self, tokens: Vec<i32>, sum_logprobs: f32) {
        let score = sum_logprobs / (tokens.len() as f32).powf(self.length_penalty);
        if self.beams.len() == self.num_beams && score <= self.beams[0].score {
            return;
        }
        let at = self.beams.partition_point(|h| h.score < score);
        self.beams.insert(at, HypothesisScore { tokens, score });
        if self.beams.len() > self.num_beams {
            self.beams.remove(0);
        }
    }

    fn is_full(&self) -> bool {
        self.beams.len() == self.num_beams
    }

    /// Whether a live beam could still beat the worst kept hypothesis,
    /// giving the live score its optimistic max-length normalization.
    fn can_improve(&self, best_sum_logprobs: f32, max_length: usize) -> bool {
        let best_possible = best_sum_logprobs / (max_length as f32).powf(self.length_penalty);
        self.beams[0].score < best_possible
    }
}

/// Per-batch beam bookkeeping: cumulative live scores, completed pools, and
/// the token/reorder outputs of each step.
pub struct BeamScorer {
    params: Arc<GeneratorParams>,
    hyps: Vec<BeamHypotheses>,
    /// Cumulative log-probability of each live beam, `[batch_beam]`.
    beam_scores: Vec<f32>,
    next_tokens: Vec<i32>,
    next_indices: Vec<i32>,
    /// Best-first hypotheses per batch after finalization.
    finalized: Option<Vec<Vec<HypothesisScore>>>,
}

impl BeamScorer {
    pub(crate) fn new(params: Arc<GeneratorParams>) -> Self {
        let batch = params.batch_size;
        let k = params.search.num_beams;
        let mut beam_scores = vec![INACTIVE_BEAM_SCORE; batch * k];
        for b in 0..batch {
            beam_scores[b * k] = 0.0;
        }
        let hyps = (0..batch)
            .map(|_| BeamHypotheses::new(k, params.search.length_penalty))
            .collect();
        Self {
            params,
            hyps,
            beam_scores,
            next_tokens: vec![0; batch * k],
            next_indices: (0..(batch * k) as i32).collect(),
            finalized: None,
        }
    }

    pub(crate) fn beam_score(&self, row: usize) -> f32 {
        self.beam_scores[row]
    }

    pub fn next_tokens(&self) -> &[i32] {
        &self.next_tokens
    }

    pub fn next_indices(&self) -> &[i32] {
        &self.next_indices
    }

    pub fn is_done(&self) -> bool {
        self.hyps.iter().all(|h| h.done)
    }

    /// Consume one step's top-2K candidates per batch, in descending score
    /// order: EOS candidates ranked inside the top K move into the completed
    /// pool, the rest fill the K live slots.
    pub(crate) fn process(
        &mut self,
        sequences: &Sequences,
        candidate_scores: &[f32],
        candidate_tokens: &[i32],
        candidate_beams: &[i32],
    ) {
        let k = self.params.search.num_beams;
        let top_k = 2 * k;
        let eos = self.params.eos_token_id;
        let pad = self.params.pad_token_id;

        for b in 0..self.params.batch_size {
            if self.hyps[b].done {
                for j in 0..k {
                    let row = b * k + j;
                    self.next_tokens[row] = pad;
                    self.next_indices[row] = row as i32;
                    self.beam_scores[row] = 0.0;
                }
                continue;
            }

            let mut new_scores = vec![INACTIVE_BEAM_SCORE; k];
            let mut new_tokens = vec![pad; k];
            let mut new_indices: Vec<i32> = (0..k).map(|j| (b * k + j) as i32).collect();
            let mut live = 0usize;

            for rank in 0..top_k {
                let i = b * top_k + rank;
                let score = candidate_scores[i];
                let token = candidate_tokens[i];
                let src_row = b * k + candidate_beams[i] as usize;

                if token == eos {
                    // Low-ranked EOS candidates never enter the pool.
                    if rank >= k {
                        continue;
                    }
                    let mut hypothesis = sequences.sequence(src_row).to_vec();
                    hypothesis.push(eos);
                    self.hyps[b].add(hypothesis, score);
                } else {
                    new_scores[live] = score;
                    new_tokens[live] = token;
                    new_indices[live] = src_row as i32;
                    live += 1;
                    if live == k {
                        break;
                    }
                }
            }

            let base = b * k;
            self.beam_scores[base..base + k].copy_from_slice(&new_scores);
            self.next_tokens[base..base + k].copy_from_slice(&new_tokens);
            self.next_indices[base..base + k].copy_from_slice(&new_indices);

            let best_candidate = candidate_scores[b * top_k];
            if self.hyps[b].is_full()
                && !self.hyps[b].can_improve(best_candidate, self.params.search.max_length)
            {
                debug!(batch = b, "beam search done for batch");
                self.hyps[b].done = true;
            }
        }
    }

    /// Top up every unfinished pool with its live beams, then order each
    /// pool best-first and keep `num_return_sequences`.
    pub(crate) fn finalize(&mut self, sequences: &Sequences) {
        let k = self.params.search.num_beams;
        for b in 0..self.params.batch_size {
            if self.hyps[b].done {
                continue;
            }
            for j in 0..k {
                let row = b * k + j;
                self.hyps[b].add(sequences.sequence(row).to_vec(), self.beam_scores[row]);
            }
        }

        let keep = self.params.search.num_return_sequences;
        let mut outputs = Vec::with_capacity(self.hyps.len());
        for hyp in &self.hyps {
            let mut best: Vec<HypothesisScore> = hyp.beams.clone();
            best.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
            best.truncate(keep);
            outputs.push(best);
        }
        self.finalized = Some(outputs);
    }

    /// Finalized hypothesis `beam_id` (0 = best) for `batch_id`.
    pub fn hypothesis(&self, batch_id: usize, beam_id: usize) -> Option<&[i32]> {
        self.finalized
            .as_ref()?
            .get(batch_id)?
            .get(beam_id)
            .map(|h| h.tokens.as_slice())
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }
}

pub struct BeamSearch {
    core: SearchCore,
    scorer: BeamScorer,
}

impl BeamSearch {
    pub(crate) fn new(params: Arc<GeneratorParams>, sequences: Sequences) -> Self {
        let scorer = BeamScorer::new(params.clone());
        Self {
            core: SearchCore::new(params, sequences),
            scorer,
        }
    }

    pub(crate) fn core(&self) -> &SearchCore {
        &self.core
    }

    pub(crate) fn core_mut(&mut self) -> &mut SearchCore {
        &mut self.core
    }

    pub fn is_done(&self) -> bool {
        self.core.done || self.scorer.is_done()
    }

    pub fn next_tokens(&self) -> &[i32] {
        self.scorer.next_tokens()
    }

    pub fn next_indices(&self) -> &[i32] {
        self.scorer.next_indices()
    }

    pub fn scorer(&self) -> &BeamScorer {
        &self.scorer
    }

    /// One beam step over the shaped `[batch_beam, vocab]` window:
    /// log-softmax, cumulative scores, per-batch top-2K, scorer bookkeeping,
    /// and the reordering append.
    pub(crate) fn select_next(&mut self, scores: &mut [f32]) -> Result<(), GeneratorError> {
        let vocab = self.core.params.vocab_size;
        let k = self.core.params.search.num_beams;
        let batch = self.core.params.batch_size;
        let top_k = 2 * k;

        for (row, window) in scores.chunks_mut(vocab).enumerate() {
            sampling::log_softmax(window);
            let beam_score = self.scorer.beam_score(row);
            for s in window.iter_mut() {
                *s += beam_score;
            }
        }

        let mut candidate_scores = vec![0.0f32; batch * top_k];
        let mut candidate_tokens = vec![0i32; batch * top_k];
        let mut candidate_beams = vec![0i32; batch * top_k];
        for b in 0..batch {
            let flat = &scores[b * k * vocab..(b + 1) * k * vocab];
            let top = top_candidates(flat, top_k);
            for (rank, &idx) in top.iter().enumerate() {
                candidate_scores[b * top_k + rank] = flat[idx];
                candidate_beams[b * top_k + rank] = (idx / vocab) as i32;
                candidate_tokens[b * top_k + rank] = (idx % vocab) as i32;
            }
        }

        self.scorer.process(
            &self.core.sequences,
            &candidate_scores,
            &candidate_tokens,
            &candidate_beams,
        );
        self.core
            .sequences
            .append_beam(self.scorer.next_indices(), self.scorer.next_tokens())?;
        if self.core.sequences.len() == self.core.params.search.max_length {
            debug!("hit max length");
            self.core.done = true;
        }
        Ok(())
    }

    pub(crate) fn finalize(&mut self) {
        if !self.scorer.is_finalized() {
            self.scorer.finalize(&self.core.sequences);
        }
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.scorer.is_finalized()
    }
}

/// Indices of the `top_k` highest entries of `flat`, descending; equal
/// scores order by flat index ascending, which encodes
/// `(beam_index, token_id)` ascending.
fn top_candidates(flat: &[f32], top_k: usize) -> Vec<usize> {
    let compare = |a: &usize, b: &usize| {
        flat[*b]
            .partial_cmp(&flat[*a])
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.cmp(b))
    };
    let mut indices: Vec<usize> = (0..flat.len()).collect();
    let top_k = top_k.min(indices.len());
    if top_k < indices.len() {
        indices.select_nth_unstable_by(top_k - 1, compare);
        indices.truncate(top_k);
    }
    indices.sort_unstable_by(compare);
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchParams;

    fn beam_params(k: usize, vocab: usize, max_length: usize) -> Arc<GeneratorParams> {
        Arc::new(GeneratorParams {
            batch_size: 1,
            vocab_size: vocab,
            eos_token_id: (vocab - 1) as i32,
            pad_token_id: 0,
            search: SearchParams {
                num_beams: k,
                max_length,
                num_return_sequences: k,
                ..Default::default()
            },
        })
    }

    #[test]
    fn hypotheses_pool_keeps_k_best() {
        let mut pool = BeamHypotheses::new(2, 1.0);
        pool.add(vec![1, 2], -4.0); // score -2.0
        pool.add(vec![1, 3], -2.0); // score -1.0
        pool.add(vec![1, 4], -6.0); // score -3.0, worse than both: dropped
        assert_eq!(pool.beams.len(), 2);
        assert_eq!(pool.beams[0].score, -2.0); // worst-first
        assert_eq!(pool.beams[1].score, -1.0);

        pool.add(vec![1, 5], -1.0); // score -0.5 displaces the worst
        assert_eq!(pool.beams[0].score, -1.0);
        assert_eq!(pool.beams[1].score, -0.5);
    }

    #[test]
    fn can_improve_uses_max_length_normalization() {
        let mut pool = BeamHypotheses::new(1, 1.0);
        pool.add(vec![1, 2], -4.0); // kept score -2.0
        // A live cumulative of -3.0 normalized at max_length 4 is -0.75.
        assert!(pool.can_improve(-3.0, 4));
        // A live cumulative of -10.0 can at best reach -2.5.
        assert!(!pool.can_improve(-10.0, 4));
    }

    #[test]
    fn top_candidates_breaks_ties_by_flat_index() {
        let flat = vec![0.5, 0.9, 0.5, 0.9];
        assert_eq!(top_candidates(&flat, 3), vec![1, 3, 0]);
    }

    #[test]
    fn initial_beam_scores_activate_one_root() {
        let scorer = BeamScorer::new(beam_params(3, 5, 10));
        assert_eq!(scorer.beam_score(0), 0.0);
        assert_eq!(scorer.beam_score(1), INACTIVE_BEAM_SCORE);
        assert_eq!(scorer.beam_score(2), INACTIVE_BEAM_SCORE);
    }

    #[test]
    fn process_routes_eos_to_pool_and_fills_live_beams() {
        let params = beam_params(2, 4, 10);
        let sequences = Sequences::from_prompt(&[0], 1, 2, 10).unwrap();
        let mut scorer = BeamScorer::new(params);

        // Candidates (rank order): eos at rank 0, then three live tokens.
        let scores = [-0.1, -0.5, -0.7, -0.9];
        let tokens = [3, 1, 2, 1]; // token 3 = eos
        let beams = [0, 0, 1, 1];
        scorer.process(&sequences, &scores, &tokens, &beams);

        assert_eq!(scorer.next_tokens(), &[1, 2]);
        assert_eq!(scorer.next_indices(), &[0, 1]);
        assert_eq!(scorer.beam_score(0), -0.5);
        assert_eq!(scorer.beam_score(1), -0.7);
        assert_eq!(scorer.hyps[0].beams.len(), 1);
        assert!(!scorer.is_done());
    }

    #[test]
    fn low_ranked_eos_is_ignored() {
        let params = beam_params(2, 4, 10);
        let sequences = Sequences::from_prompt(&[0], 1, 2, 10).unwrap();
        let mut scorer = BeamScorer::new(params);

        let scores = [-0.1, -0.5, -0.7, -0.9];
        let tokens = [1, 2, 3, 3]; // eos only at ranks >= k
        let beams = [0, 0, 0, 1];
        scorer.process(&sequences, &scores, &tokens, &beams);

        assert!(scorer.hyps[0].beams.is_empty());
        assert_eq!(scorer.next_tokens(), &[1, 2]);
    }

    #[test]
    fn done_batch_emits_pads_with_identity_indices() {
        let params = beam_params(2, 4, 10);
        let sequences = Sequences::from_prompt(&[0], 1, 2, 10).unwrap();
        let mut scorer = BeamScorer::new(params);
        scorer.hyps[0].done = true;

        let scores = [-0.1, -0.5, -0.7, -0.9];
        let tokens = [1, 2, 1, 2];
        let beams = [0, 0, 1, 1];
        scorer.process(&sequences, &scores, &tokens, &beams);

        assert_eq!(scorer.next_tokens(), &[0, 0]);
        assert_eq!(scorer.next_indices(), &[0, 1]);
        assert!(scorer.is_done());
    }

    #[test]
    fn finalize_orders_hypotheses_best_first() {
        let params = beam_params(2, 4, 10);
        let sequences = Sequences::from_prompt(&[0], 1, 2, 10).unwrap();
        let mut scorer = BeamScorer::new(params);
        scorer.beam_scores[0] = -3.0;
        scorer.beam_scores[1] = -1.0;
        scorer.finalize(&sequences);

        // Row 1 (score -1.0) must outrank row 0 (score -3.0).
        assert_eq!(scorer.hypothesis(0, 0), Some(&[0][..]));
        assert_eq!(scorer.hypothesis(0, 1), Some(&[0][..]));
        let scores: Vec<f32> = scorer.finalized.as_ref().unwrap()[0]
            .iter()
            .map(|h| h.score)
            .collect();
        assert!(scores[0] >= scores[1]);
        assert_eq!(scorer.hypothesis(0, 2), None);
    }

    #[test]
    fn beam_search_step_appends_reordered_tokens() {
        let params = beam_params(2, 3, 4);
        let sequences = Sequences::from_prompt(&[0], 1, 2, 4).unwrap();
        let mut search = BeamSearch::new(params, sequences);

        // Both rows identical (replicated prompt); beam 1 is inactive, so
        // both selected candidates extend beam 0.
        let mut scores = vec![2.0, 1.0, -5.0, 2.0, 1.0, -5.0];
        search.select_next(&mut scores).unwrap();
        assert_eq!(search.next_tokens(), &[0, 1]);
        assert_eq!(search.next_indices(), &[0, 0]);
        assert_eq!(search.core().sequences.sequence(0), &[0, 0]);
        assert_eq!(search.core().sequences.sequence(1), &[0, 1]);
    }
}
