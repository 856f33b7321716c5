//! Scripted backends for driving the generation loop in tests.

use std::cell::RefCell;
use std::collections::VecDeque;

use candle_core::{DType, Device, Tensor};

use crate::model::{BackendError, KvLayer, KvSignature, ModelBackend, StepContext};
use crate::spec_decode::DraftProposer;

/// Backend that replays a script of logits, one entry per `run` call, and
/// fabricates correctly shaped present KV tensors.
pub struct ScriptedBackend {
    vocab_size: usize,
    signature: KvSignature,
    logits_dtype: DType,
    kv_dtype: DType,
    device: Device,
    steps: VecDeque<Vec<f32>>,
    /// Skip present outputs, as a shared-buffer backend would.
    shared_buffer: bool,
    calls: usize,
}

impl ScriptedBackend {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            signature: KvSignature {
                layer_count: 1,
                num_kv_heads: 1,
                head_dim: 1,
            },
            logits_dtype: DType::F32,
            kv_dtype: DType::F32,
            device: Device::Cpu,
            steps: VecDeque::new(),
            shared_buffer: false,
            calls: 0,
        }
    }

    pub fn with_signature(mut self, signature: KvSignature) -> Self {
        self.signature = signature;
        self
    }

    pub fn with_logits_dtype(mut self, dtype: DType) -> Self {
        self.logits_dtype = dtype;
        self
    }

    pub fn shared_buffer(mut self) -> Self {
        self.shared_buffer = true;
        self
    }

    /// Queue the flattened `[batch_beam * token_count * vocab]` logits for
    /// the next `run` call.
    pub fn script_step(mut self, logits: Vec<f32>) -> Self {
        self.steps.push_back(logits);
        self
    }

    /// Convenience: one `[vocab]` row replicated across every batch-beam row.
    pub fn script_row(self, row: Vec<f32>, batch_beam_size: usize) -> Self {
        let mut step = Vec::with_capacity(row.len() * batch_beam_size);
        for _ in 0..batch_beam_size {
            step.extend_from_slice(&row);
        }
        self.script_step(step)
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl ModelBackend for ScriptedBackend {
    fn run(&mut self, ctx: &mut StepContext) -> Result<(), BackendError> {
        self.calls += 1;
        let rows = ctx.batch_beam_size;
        let expected = rows * ctx.token_count * self.vocab_size;
        let step = self
            .steps
            .pop_front()
            .ok_or_else(|| format!("scripted backend exhausted at call {}", self.calls))?;
        if step.len() != expected {
            return Err(format!(
                "scripted step holds {} scores, call needs {expected}",
                step.len()
            )
            .into());
        }

        let logits = Tensor::from_vec(step, (rows, ctx.token_count, self.vocab_size), &self.device)?
            .to_dtype(self.logits_dtype)?;
        ctx.logits = Some(logits);

        if !self.shared_buffer {
            let sig = self.signature;
            let shape = (
                rows,
                sig.num_kv_heads,
                ctx.past_length + ctx.token_count,
                sig.head_dim,
            );
            let mut present = Vec::with_capacity(sig.layer_count);
            for _ in 0..sig.layer_count {
                present.push(KvLayer {
                    key: Tensor::zeros(shape, self.kv_dtype, &self.device)?,
                    value: Tensor::zeros(shape, self.kv_dtype, &self.device)?,
                });
            }
            ctx.present = present;
        }
        Ok(())
    }

    fn logits_dtype(&self) -> DType {
        self.logits_dtype
    }

    fn kv_dtype(&self) -> DType {
        self.kv_dtype
    }

    fn kv_signature(&self) -> KvSignature {
        self.signature
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Draft proposer replaying scripted candidate sequences.
pub struct FixedDraft {
    drafts: RefCell<VecDeque<Vec<i32>>>,
}

impl FixedDraft {
    pub fn new(drafts: Vec<Vec<i32>>) -> Self {
        Self {
            drafts: RefCell::new(drafts.into()),
        }
    }
}

impl DraftProposer for FixedDraft {
    fn propose(&self, _token_ids: &[i32], max_tokens: usize) -> Vec<i32> {
        let mut draft = self.drafts.borrow_mut().pop_front().unwrap_or_default();
        draft.truncate(max_tokens);
        draft
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_backend_validates_window_size() {
        let mut backend = ScriptedBackend::new(3).script_step(vec![0.0; 3]);
        let mut ctx = StepContext::new(vec![0, 0], 1, 0, 2);
        assert!(backend.run(&mut ctx).is_err());
    }

    #[test]
    fn scripted_backend_shapes_present_kv() {
        let mut backend = ScriptedBackend::new(2).script_step(vec![0.5, 0.5]);
        let mut ctx = StepContext::new(vec![7], 1, 3, 1);
        backend.run(&mut ctx).unwrap();
        assert_eq!(ctx.present.len(), 1);
        assert_eq!(ctx.present[0].key.dims(), &[1, 1, 4, 1]);
        assert_eq!(ctx.logits.as_ref().unwrap().dims(), &[1, 1, 2]);
    }

    #[test]
    fn fixed_draft_replays_in_order() {
        let draft = FixedDraft::new(vec![vec![1, 2, 3], vec![4]]);
        assert_eq!(draft.propose(&[], 2), vec![1, 2]);
        assert_eq!(draft.propose(&[], 8), vec![4]);
        assert!(draft.propose(&[], 8).is_empty());
    }
}
