//! Error taxonomy for the generation core.

use thiserror::Error;

use crate::kv_cache::CacheError;

/// Opaque error type produced by a [`ModelBackend`](crate::model::ModelBackend).
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the generation core.
///
/// Fatal errors abort the current generation; partial sequences remain
/// readable through the generator until it is dropped.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// Contradictory or out-of-range generation parameters, detected at
    /// construction time.
    #[error("invalid generation config: {0}")]
    ConfigInvalid(String),

    /// The model backend returned tensors incompatible with its declared
    /// signature.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The sequence store cannot hold another token. Callers treat this as
    /// normal termination, not a failure.
    #[error("sequence storage exhausted at length {0}")]
    OutOfSpace(usize),

    /// Speculative decoding was requested with an unsupported batch size.
    #[error("speculative decoding requires batch_size == 1, got {0}")]
    SpeculativeBatchSize(usize),

    /// Opaque failure propagated from the model backend.
    #[error("model failure: {0}")]
    Model(#[source] BackendError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}
