//! Logits buffer: dtype conversion, windowing, and NaN containment.
//!
//! Holds the fp32 copy of one step's raw model output and hands mutable
//! `[batch_beam, vocab]` windows to the shaping and selection stages.

use candle_core::{DType, Tensor};
use tracing::warn;

use crate::config::GeneratorParams;
use crate::error::GeneratorError;
use crate::sampling;

pub(crate) struct Logits {
    scores: Vec<f32>,
    token_count: usize,
    batch_beam_size: usize,
    vocab_size: usize,
    pad_token_id: i32,
}

impl Logits {
    pub(crate) fn new(params: &GeneratorParams) -> Self {
        Self {
            scores: Vec::new(),
            token_count: 0,
            batch_beam_size: params.batch_beam_size(),
            vocab_size: params.vocab_size,
            pad_token_id: params.pad_token_id,
        }
    }

    /// Validate and absorb one step's raw logits, converting fp16/bf16 to
    /// fp32. NaN-poisoned positions are rewritten so the row can only emit
    /// the pad token.
    pub(crate) fn set_output(
        &mut self,
        raw: &Tensor,
        expected_tokens: usize,
    ) -> Result<(), GeneratorError> {
        let (rows, tokens, vocab) = raw.dims3().map_err(|_| {
            GeneratorError::ShapeMismatch(format!(
                "logits must be rank 3 [batch_beam, tokens, vocab], got {:?}",
                raw.dims()
            ))
        })?;
        if rows != self.batch_beam_size || tokens != expected_tokens || vocab != self.vocab_size {
            return Err(GeneratorError::ShapeMismatch(format!(
                "logits shape [{rows}, {tokens}, {vocab}] does not match expected [{}, {}, {}]",
                self.batch_beam_size, expected_tokens, self.vocab_size
            )));
        }
        let converted = match raw.dtype() {
            DType::F32 => raw.clone(),
            DType::F16 | DType::BF16 => raw.to_dtype(DType::F32)?,
            other => {
                return Err(GeneratorError::ShapeMismatch(format!(
                    "unsupported logits dtype {other:?}"
                )))
            }
        };
        self.scores = converted.flatten_all()?.to_vec1::<f32>()?;
        self.token_count = tokens;

        for (pos, window) in self.scores.chunks_mut(self.vocab_size).enumerate() {
            if sampling::scrub_nan(window, self.pad_token_id) {
                warn!(position = pos, "NaN logits scrubbed, row forced to pad");
            }
        }
        Ok(())
    }

    /// The `[batch_beam, vocab]` window of each row's final position.
    /// Compacts multi-token prompt output down to the last token.
    pub(crate) fn last_window(&mut self) -> &mut [f32] {
        if self.token_count > 1 {
            let mut last = Vec::with_capacity(self.batch_beam_size * self.vocab_size);
            for row in 0..self.batch_beam_size {
                let start = (row * self.token_count + self.token_count - 1) * self.vocab_size;
                last.extend_from_slice(&self.scores[start..start + self.vocab_size]);
            }
            self.scores = last;
            self.token_count = 1;
        }
        &mut self.scores
    }

    /// One position's `[vocab]` window during speculative verification.
    /// Only meaningful for batch-beam size 1.
    pub(crate) fn position_window(&mut self, position: usize) -> &mut [f32] {
        debug_assert_eq!(self.batch_beam_size, 1);
        debug_assert!(position < self.token_count);
        let start = position * self.vocab_size;
        &mut self.scores[start..start + self.vocab_size]
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::config::SearchParams;

    fn params(batch: usize, vocab: usize) -> GeneratorParams {
        GeneratorParams {
            batch_size: batch,
            vocab_size: vocab,
            eos_token_id: 0,
            pad_token_id: 0,
            search: SearchParams::default(),
        }
    }

    fn tensor(data: Vec<f32>, shape: (usize, usize, usize)) -> Tensor {
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn absorbs_single_token_output() {
        let mut logits = Logits::new(&params(2, 3));
        let raw = tensor(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 1, 3));
        logits.set_output(&raw, 1).unwrap();
        assert_eq!(logits.last_window(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn prompt_output_compacts_to_last_position() {
        let mut logits = Logits::new(&params(2, 2));
        // Two rows, three positions each.
        let raw = tensor(
            vec![
                0.0, 0.1, 1.0, 1.1, 2.0, 2.1, // row 0
                3.0, 3.1, 4.0, 4.1, 5.0, 5.1, // row 1
            ],
            (2, 3, 2),
        );
        logits.set_output(&raw, 3).unwrap();
        assert_eq!(logits.last_window(), &[2.0, 2.1, 5.0, 5.1]);
    }

    #[test]
    fn converts_half_precision() {
        let mut logits = Logits::new(&params(1, 2));
        let raw = tensor(vec![1.5, -2.0], (1, 1, 2))
            .to_dtype(DType::F16)
            .unwrap();
        logits.set_output(&raw, 1).unwrap();
        assert_eq!(logits.last_window(), &[1.5, -2.0]);
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let mut logits = Logits::new(&params(1, 4));
        let raw = tensor(vec![0.0; 6], (1, 2, 3));
        assert!(matches!(
            logits.set_output(&raw, 2),
            Err(GeneratorError::ShapeMismatch(_))
        ));
        let raw = tensor(vec![0.0; 4], (1, 1, 4));
        assert!(logits.set_output(&raw, 2).is_err());
    }

    #[test]
    fn rejects_integer_logits() {
        let mut logits = Logits::new(&params(1, 2));
        let raw = tensor(vec![0.0, 0.0], (1, 1, 2))
            .to_dtype(DType::U8)
            .unwrap();
        assert!(logits.set_output(&raw, 1).is_err());
    }

    #[test]
    fn nan_rows_collapse_to_pad() {
        let mut logits = Logits::new(&params(1, 3));
        let raw = tensor(vec![1.0, f32::NAN, 9.0], (1, 1, 3));
        logits.set_output(&raw, 1).unwrap();
        let window = logits.last_window();
        assert_eq!(window[0], 0.0);
        assert_eq!(window[1], f32::NEG_INFINITY);
        assert_eq!(window[2], f32::NEG_INFINITY);
    }

    #[test]
    fn position_window_indexes_verification_slots() {
        let mut logits = Logits::new(&params(1, 2));
        let raw = tensor(vec![0.0, 1.0, 2.0, 3.0], (1, 2, 2));
        logits.set_output(&raw, 2).unwrap();
        assert_eq!(logits.position_window(0), &[0.0, 1.0]);
        assert_eq!(logits.position_window(1), &[2.0, 3.0]);
    }
}
