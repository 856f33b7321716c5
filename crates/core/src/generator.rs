//! Generation driver: owns the search, logits buffer, and KV cache, and
//! runs the fixed per-step order — model, shaping, selection, append, KV
//! rotation, termination check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::GeneratorParams;
use crate::error::GeneratorError;
use crate::kv_cache::{CacheConfig, CrossCache, KvCache};
use crate::logits::Logits;
use crate::model::{KvLayer, ModelBackend, StepContext};
use crate::search::{BeamSearch, GreedySearch, Search, SpeculativeSearch};
use crate::sequences::Sequences;
use crate::spec_decode::DraftProposer;

/// Outcome of one generation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepResult {
    /// Tokens appended to every row this step (1, or the accepted count for
    /// speculative steps).
    pub tokens_added: usize,
    pub done: bool,
}

/// Cross-thread cancellation signal, polled between steps.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct Generator<M: ModelBackend> {
    params: Arc<GeneratorParams>,
    model: M,
    logits: Logits,
    kv_cache: KvCache,
    cross_cache: Option<CrossCache>,
    search: Option<Search>,
    draft: Option<Box<dyn DraftProposer>>,
    cancelled: Arc<AtomicBool>,
}

impl<M: ModelBackend> Generator<M> {
    pub fn new(model: M, params: GeneratorParams) -> Result<Self, GeneratorError> {
        Self::build(model, params, None)
    }

    /// Construct a speculative generator verifying drafts from `proposer`.
    pub fn with_draft(
        model: M,
        params: GeneratorParams,
        proposer: Box<dyn DraftProposer>,
    ) -> Result<Self, GeneratorError> {
        if params.batch_size != 1 {
            return Err(GeneratorError::SpeculativeBatchSize(params.batch_size));
        }
        if params.search.num_beams != 1 {
            return Err(GeneratorError::ConfigInvalid(
                "speculative decoding cannot be combined with beam search".into(),
            ));
        }
        Self::build(model, params, Some(proposer))
    }

    fn build(
        model: M,
        params: GeneratorParams,
        draft: Option<Box<dyn DraftProposer>>,
    ) -> Result<Self, GeneratorError> {
        params.validate()?;
        let params = Arc::new(params);
        let kv_cache = KvCache::new(CacheConfig {
            batch_beam_size: params.batch_beam_size(),
            max_length: params.search.max_length,
            signature: model.kv_signature(),
            dtype: model.kv_dtype(),
            device: model.device().clone(),
            share_buffer: params.search.past_present_share_buffer,
        })?;
        let logits = Logits::new(&params);
        Ok(Self {
            params,
            model,
            logits,
            kv_cache,
            cross_cache: None,
            search: None,
            draft,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn params(&self) -> &GeneratorParams {
        &self.params
    }

    pub fn kv_cache(&self) -> &KvCache {
        &self.kv_cache
    }

    /// Install encoder cross-attention KV, bound read-only to every decoder
    /// step.
    pub fn set_cross_cache(&mut self, layers: Vec<KvLayer>) -> Result<(), GeneratorError> {
        let cross = CrossCache::new(
            layers,
            self.model.kv_signature(),
            self.model.kv_dtype(),
            self.params.batch_beam_size(),
        )?;
        self.cross_cache = Some(cross);
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.search.as_ref().is_some_and(|s| s.is_done())
    }

    /// Request cancellation. The in-progress step finishes; the next `step`
    /// call observes the signal and terminates with partial sequences
    /// readable.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancelled.clone())
    }

    /// The generated (or finalized) sequence for one batch entry and beam.
    pub fn sequence(&self, batch_id: usize, beam_id: usize) -> Option<&[i32]> {
        let search = self.search.as_ref()?;
        match search {
            Search::Beam(beam) if beam.is_finalized() => {
                beam.scorer().hypothesis(batch_id, beam_id)
            }
            _ => {
                let num_beams = self.params.search.num_beams;
                if batch_id >= self.params.batch_size || beam_id >= num_beams {
                    return None;
                }
                Some(search.sequences().sequence(batch_id * num_beams + beam_id))
            }
        }
    }

    /// Initialize the sequence store from a dense `[batch, prompt]` window
    /// and run the first step over the whole prompt.
    pub fn feed_prompt(&mut self, token_ids: &[i32]) -> Result<StepResult, GeneratorError> {
        if self.search.is_some() {
            return Err(GeneratorError::ConfigInvalid(
                "prompt already fed for this generation".into(),
            ));
        }
        let sequences = Sequences::from_prompt(
            token_ids,
            self.params.batch_size,
            self.params.search.num_beams,
            self.params.search.max_length,
        )?;
        let prompt_len = sequences.len();
        let batch_beam_size = self.params.batch_beam_size();
        let mut input = Vec::with_capacity(batch_beam_size * prompt_len);
        for row in 0..batch_beam_size {
            input.extend_from_slice(sequences.sequence(row));
        }

        let params = self.params.clone();
        self.search = Some(if params.search.num_beams > 1 {
            Search::Beam(BeamSearch::new(params, sequences))
        } else if self.draft.is_some() {
            Search::Speculative(SpeculativeSearch::new(params, sequences))
        } else {
            Search::Greedy(GreedySearch::new(params, sequences))
        });
        self.decode_step(input, prompt_len)
    }

    /// Advance one token per row, or one verification round for speculative
    /// generators.
    pub fn step(&mut self) -> Result<StepResult, GeneratorError> {
        let search = self.search.as_mut().ok_or_else(|| {
            GeneratorError::ConfigInvalid("feed_prompt must run before step".into())
        })?;
        if search.is_done() {
            return Ok(StepResult {
                tokens_added: 0,
                done: true,
            });
        }
        if self.cancelled.load(Ordering::SeqCst) {
            debug!("cancellation observed between steps");
            search.core_mut().done = true;
            if let Search::Beam(beam) = search {
                beam.finalize();
            }
            return Ok(StepResult {
                tokens_added: 0,
                done: true,
            });
        }

        let speculative = matches!(search, Search::Speculative(_));
        let input = search.next_tokens().to_vec();
        if speculative {
            self.step_speculative()
        } else {
            self.decode_step(input, 1)
        }
    }

    fn decode_step(
        &mut self,
        input_ids: Vec<i32>,
        token_count: usize,
    ) -> Result<StepResult, GeneratorError> {
        let Self {
            params,
            model,
            logits,
            kv_cache,
            cross_cache,
            search,
            ..
        } = self;
        let search = search.as_mut().ok_or_else(|| {
            GeneratorError::ConfigInvalid("feed_prompt must run before step".into())
        })?;

        let past_length = kv_cache.past_length();
        let mut ctx = StepContext::new(
            input_ids,
            token_count,
            past_length,
            params.batch_beam_size(),
        );
        kv_cache.bind(&mut ctx);
        if let Some(cross) = cross_cache {
            cross.bind(&mut ctx);
        }
        model.run(&mut ctx).map_err(GeneratorError::Model)?;

        let raw = ctx.logits.take().ok_or_else(|| {
            GeneratorError::ShapeMismatch("backend produced no logits".into())
        })?;
        logits.set_output(&raw, token_count)?;
        let scores = logits.last_window();
        search.core().apply_min_length(scores);
        search.core().apply_repetition_penalty(scores);
        search.select_next(scores)?;

        kv_cache.update(&mut ctx, search.next_indices(), past_length + token_count)?;

        let done = search.is_done();
        if done {
            if let Search::Beam(beam) = search {
                beam.finalize();
            }
        }
        Ok(StepResult {
            tokens_added: 1,
            done,
        })
    }

    fn step_speculative(&mut self) -> Result<StepResult, GeneratorError> {
        let Self {
            params,
            model,
            logits,
            kv_cache,
            cross_cache,
            search,
            draft,
            ..
        } = self;
        let Some(Search::Speculative(search)) = search.as_mut() else {
            return Err(GeneratorError::ConfigInvalid(
                "speculative step requires a speculative search".into(),
            ));
        };

        let sequence_length = search.inner().core().sequences.len();
        let past_length = kv_cache.past_length();
        let room = params.search.max_length - sequence_length;
        let mut draft_tokens = match draft {
            Some(proposer) if room > 1 => {
                proposer.propose(search.inner().core().sequences.sequence(0), room - 1)
            }
            _ => Vec::new(),
        };
        draft_tokens.truncate(room - 1);
        let candidate_length = draft_tokens.len();

        // Window: committed-but-uncached tail plus the draft candidates.
        let mut input = search.inner().core().sequences.sequence(0)[past_length..].to_vec();
        input.extend_from_slice(&draft_tokens);
        let token_count = input.len();
        let base_position = token_count - candidate_length - 1;

        kv_cache.update_present(past_length + token_count)?;
        let mut ctx = StepContext::new(input, token_count, past_length, 1);
        kv_cache.bind(&mut ctx);
        if let Some(cross) = cross_cache {
            cross.bind(&mut ctx);
        }
        model.run(&mut ctx).map_err(GeneratorError::Model)?;

        let raw = ctx.logits.take().ok_or_else(|| {
            GeneratorError::ShapeMismatch("backend produced no logits".into())
        })?;
        logits.set_output(&raw, token_count)?;

        let accepted = search.check_candidates(logits, &draft_tokens, base_position)?;
        let new_length = search.inner().core().sequences.len();
        kv_cache.update_and_resize(&mut ctx, past_length + token_count, new_length - 1)?;

        Ok(StepResult {
            tokens_added: accepted,
            done: search.inner().is_done(),
        })
    }

    /// Roll back the last `count` committed tokens, resurrecting rows whose
    /// EOS falls inside the dropped suffix and shrinking the KV past to
    /// match. Not available under beam search.
    pub fn drop_last_tokens(&mut self, count: usize) -> Result<(), GeneratorError> {
        let search = self.search.as_mut().ok_or_else(|| {
            GeneratorError::ConfigInvalid("feed_prompt must run before rollback".into())
        })?;
        match search {
            Search::Greedy(greedy) => greedy.drop_last_tokens(count)?,
            Search::Speculative(spec) => spec.inner_mut().drop_last_tokens(count)?,
            Search::Beam(_) => {
                return Err(GeneratorError::ConfigInvalid(
                    "rollback is not supported for beam search".into(),
                ))
            }
        }
        let new_length = search.sequences().len();
        let target = new_length
            .saturating_sub(1)
            .min(self.kv_cache.past_length());
        self.kv_cache.truncate_past(target)?;
        Ok(())
    }
}
