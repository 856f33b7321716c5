//! Past/present KV-cache lifecycle.
//!
//! Three variants share one type, selected by configuration:
//! - standard: the backend returns full present tensors each step and
//!   `update` rotates them into past, gathering by beam indices when the
//!   search reordered rows;
//! - shared-buffer: past and present alias one preallocated
//!   `[batch_beam, heads, max_length, dim]` allocation the backend appends
//!   into; `update` only advances the logical length;
//! - speculative resize: `update_present` declares a grown verification
//!   window, `update_and_resize` shrinks past after partial acceptance.

mod gather;

use candle_core::{DType, Device, Tensor};
use thiserror::Error;
use tracing::debug;

use crate::model::{KvLayer, KvSignature, StepContext};

use gather::gather_layer;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("kv tensor shape mismatch: expected {expected:?}, got {got:?}")]
    Shape { expected: Vec<usize>, got: Vec<usize> },

    #[error("kv dtype mismatch: expected {expected:?}, got {got:?}")]
    Dtype { expected: DType, got: DType },

    #[error("unsupported kv dtype {0:?}")]
    UnsupportedDtype(DType),

    #[error("expected {expected} present layers, backend produced {got}")]
    LayerCount { expected: usize, got: usize },

    #[error("shared-buffer cache expects in-place writes, backend returned {0} present layers")]
    SharedPresent(usize),

    #[error("present window may only grow: requested {requested}, already {current}")]
    PresentShrink { requested: usize, current: usize },

    #[error("past resize to {requested} exceeds present length {available}")]
    PastResize { requested: usize, available: usize },

    #[error("beam index {0} out of range for batch-beam size {1}")]
    BeamIndex(i32, usize),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Geometry and placement for one generation's cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub batch_beam_size: usize,
    pub max_length: usize,
    pub signature: KvSignature,
    pub dtype: DType,
    pub device: Device,
    pub share_buffer: bool,
}

pub struct KvCache {
    config: CacheConfig,
    /// None until the first `update`; an empty past binds as no tensors.
    pasts: Option<Vec<KvLayer>>,
    past_length: usize,
    /// Declared present window for the next step, set by `update_present`.
    expected_present: Option<usize>,
}

impl KvCache {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        match config.dtype {
            DType::F32 | DType::F16 | DType::BF16 | DType::U8 => {}
            other => return Err(CacheError::UnsupportedDtype(other)),
        }

        let pasts = if config.share_buffer {
            let sig = config.signature;
            let shape = (
                config.batch_beam_size,
                sig.num_kv_heads,
                config.max_length,
                sig.head_dim,
            );
            let mut layers = Vec::with_capacity(sig.layer_count);
            for _ in 0..sig.layer_count {
                layers.push(KvLayer {
                    key: Tensor::zeros(shape, config.dtype, &config.device)?,
                    value: Tensor::zeros(shape, config.dtype, &config.device)?,
                });
            }
            Some(layers)
        } else {
            None
        };

        Ok(Self {
            config,
            pasts,
            past_length: 0,
            expected_present: None,
        })
    }

    /// Sequence positions currently covered by past.
    pub fn past_length(&self) -> usize {
        self.past_length
    }

    /// Bind past tensors as model inputs for this step.
    pub fn bind(&self, ctx: &mut StepContext) {
        ctx.past = match &self.pasts {
            Some(layers) => layers.clone(),
            None => Vec::new(),
        };
    }

    /// Rotate present into past after a step.
    ///
    /// With identity (or absent) beam indices this is a buffer move; with a
    /// real reorder it gathers every layer along the batch-beam axis.
    pub fn update(
        &mut self,
        ctx: &mut StepContext,
        beam_indices: Option<&[i32]>,
        current_length: usize,
    ) -> Result<(), CacheError> {
        if self.config.share_buffer {
            if !ctx.present.is_empty() {
                return Err(CacheError::SharedPresent(ctx.present.len()));
            }
            self.past_length = current_length;
            return Ok(());
        }

        let present = std::mem::take(&mut ctx.present);
        let expected_len = self.expected_present.take().unwrap_or(current_length);
        self.validate_present(&present, expected_len)?;

        self.pasts = Some(match beam_indices {
            Some(indices) if !is_identity(indices) => {
                debug!(?indices, "reordering kv past by beam indices");
                let mut gathered = Vec::with_capacity(present.len());
                for layer in &present {
                    gathered.push(gather_layer(layer, indices, self.config.batch_beam_size)?);
                }
                gathered
            }
            _ => present,
        });
        self.past_length = current_length;
        Ok(())
    }

    /// Declare the present window for the next (speculative) step. Grow only.
    pub fn update_present(&mut self, new_length: usize) -> Result<(), CacheError> {
        if let Some(current) = self.expected_present {
            if new_length < current {
                return Err(CacheError::PresentShrink {
                    requested: new_length,
                    current,
                });
            }
        }
        if new_length < self.past_length {
            return Err(CacheError::PresentShrink {
                requested: new_length,
                current: self.past_length,
            });
        }
        self.expected_present = Some(new_length);
        Ok(())
    }

    /// Consume a present of `current_length` positions and keep only the
    /// first `past_length` of them, discarding draft tokens that were not
    /// accepted.
    pub fn update_and_resize(
        &mut self,
        ctx: &mut StepContext,
        current_length: usize,
        past_length: usize,
    ) -> Result<(), CacheError> {
        if self.config.share_buffer {
            if !ctx.present.is_empty() {
                return Err(CacheError::SharedPresent(ctx.present.len()));
            }
            self.past_length = past_length;
            self.expected_present = None;
            return Ok(());
        }

        if past_length > current_length {
            return Err(CacheError::PastResize {
                requested: past_length,
                available: current_length,
            });
        }
        if let Some(declared) = self.expected_present.take() {
            if declared != current_length {
                return Err(CacheError::Shape {
                    expected: vec![declared],
                    got: vec![current_length],
                });
            }
        }
        let present = std::mem::take(&mut ctx.present);
        self.validate_present(&present, current_length)?;

        if past_length == 0 {
            self.pasts = None;
            self.past_length = 0;
            return Ok(());
        }
        let mut resized = Vec::with_capacity(present.len());
        for layer in &present {
            resized.push(KvLayer {
                key: layer.key.narrow(2, 0, past_length)?.contiguous()?,
                value: layer.value.narrow(2, 0, past_length)?.contiguous()?,
            });
        }
        self.pasts = Some(resized);
        self.past_length = past_length;
        Ok(())
    }

    /// Shrink the stored past to `past_length` without consuming a present.
    /// Used when the search rolls committed tokens back.
    pub fn truncate_past(&mut self, past_length: usize) -> Result<(), CacheError> {
        if past_length > self.past_length {
            return Err(CacheError::PastResize {
                requested: past_length,
                available: self.past_length,
            });
        }
        if self.config.share_buffer {
            self.past_length = past_length;
            return Ok(());
        }
        if past_length == 0 {
            self.pasts = None;
            self.past_length = 0;
            return Ok(());
        }
        if let Some(layers) = &self.pasts {
            let mut truncated = Vec::with_capacity(layers.len());
            for layer in layers {
                truncated.push(KvLayer {
                    key: layer.key.narrow(2, 0, past_length)?.contiguous()?,
                    value: layer.value.narrow(2, 0, past_length)?.contiguous()?,
                });
            }
            self.pasts = Some(truncated);
        }
        self.past_length = past_length;
        Ok(())
    }

    /// Gather one stored past layer by beam indices, dispatched on the
    /// tensor dtype.
    pub fn pick_past_state(
        &self,
        beam_indices: &[i32],
        layer_index: usize,
    ) -> Result<KvLayer, CacheError> {
        let layers = self.pasts.as_ref().ok_or(CacheError::LayerCount {
            expected: self.config.signature.layer_count,
            got: 0,
        })?;
        let layer = layers.get(layer_index).ok_or(CacheError::LayerCount {
            expected: self.config.signature.layer_count,
            got: layers.len(),
        })?;
        gather_layer(layer, beam_indices, self.config.batch_beam_size)
    }

    fn validate_present(&self, present: &[KvLayer], seq_len: usize) -> Result<(), CacheError> {
        let sig = self.config.signature;
        if present.len() != sig.layer_count {
            return Err(CacheError::LayerCount {
                expected: sig.layer_count,
                got: present.len(),
            });
        }
        let expected = [
            self.config.batch_beam_size,
            sig.num_kv_heads,
            seq_len,
            sig.head_dim,
        ];
        for layer in present {
            for tensor in [&layer.key, &layer.value] {
                if tensor.dtype() != self.config.dtype {
                    return Err(CacheError::Dtype {
                        expected: self.config.dtype,
                        got: tensor.dtype(),
                    });
                }
                let dims = tensor.dims();
                if dims != expected.as_slice() {
                    return Err(CacheError::Shape {
                        expected: expected.to_vec(),
                        got: dims.to_vec(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn is_identity(indices: &[i32]) -> bool {
    indices
        .iter()
        .enumerate()
        .all(|(row, &idx)| idx as usize == row)
}

/// Encoder cross-attention cache: produced once by the encoder step and
/// bound read-only to every decoder step thereafter.
pub struct CrossCache {
    layers: Vec<KvLayer>,
}

impl CrossCache {
    /// Validate encoder outputs against the declared KV geometry. The
    /// encoder sequence axis is free; everything else must match.
    pub fn new(
        layers: Vec<KvLayer>,
        signature: KvSignature,
        dtype: DType,
        batch_beam_size: usize,
    ) -> Result<Self, CacheError> {
        if layers.len() != signature.layer_count {
            return Err(CacheError::LayerCount {
                expected: signature.layer_count,
                got: layers.len(),
            });
        }
        for layer in &layers {
            for tensor in [&layer.key, &layer.value] {
                if tensor.dtype() != dtype {
                    return Err(CacheError::Dtype {
                        expected: dtype,
                        got: tensor.dtype(),
                    });
                }
                let (bb, heads, _, dim) = tensor.dims4()?;
                if bb != batch_beam_size
                    || heads != signature.num_kv_heads
                    || dim != signature.head_dim
                {
                    return Err(CacheError::Shape {
                        expected: vec![
                            batch_beam_size,
                            signature.num_kv_heads,
                            0,
                            signature.head_dim,
                        ],
                        got: tensor.dims().to_vec(),
                    });
                }
            }
        }
        Ok(Self { layers })
    }

    pub fn bind(&self, ctx: &mut StepContext) {
        ctx.cross = self.layers.clone();
    }
}
