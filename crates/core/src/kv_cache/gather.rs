//! Beam-index gather over past/present tensors.
//!
//! One monomorphic kernel per element type, dispatched on the runtime dtype
//! tag. Rows are `[heads * seq * dim]` slices along the batch-beam axis.

use candle_core::{DType, Tensor, WithDType};
use half::{bf16, f16};

use super::CacheError;
use crate::model::KvLayer;

pub(crate) fn gather_layer(
    layer: &KvLayer,
    beam_indices: &[i32],
    batch_beam_size: usize,
) -> Result<KvLayer, CacheError> {
    Ok(KvLayer {
        key: gather_batch_beam(&layer.key, beam_indices, batch_beam_size)?,
        value: gather_batch_beam(&layer.value, beam_indices, batch_beam_size)?,
    })
}

/// Gather rows of a `[batch_beam, heads, seq, dim]` tensor by beam indices.
pub(crate) fn gather_batch_beam(
    tensor: &Tensor,
    beam_indices: &[i32],
    batch_beam_size: usize,
) -> Result<Tensor, CacheError> {
    for &idx in beam_indices {
        if idx < 0 || idx as usize >= batch_beam_size {
            return Err(CacheError::BeamIndex(idx, batch_beam_size));
        }
    }
    match tensor.dtype() {
        DType::F32 => gather_rows::<f32>(tensor, beam_indices),
        DType::F16 => gather_rows::<f16>(tensor, beam_indices),
        DType::BF16 => gather_rows::<bf16>(tensor, beam_indices),
        DType::U8 => gather_rows::<u8>(tensor, beam_indices),
        other => Err(CacheError::UnsupportedDtype(other)),
    }
}

fn gather_rows<T: WithDType + Copy>(
    tensor: &Tensor,
    beam_indices: &[i32],
) -> Result<Tensor, CacheError> {
    let (batch_beam, heads, seq, dim) = tensor.dims4()?;
    let row_len = heads * seq * dim;
    let rows = tensor
        .contiguous()?
        .reshape((batch_beam, row_len))?
        .to_vec2::<T>()?;

    let mut out: Vec<T> = Vec::with_capacity(beam_indices.len() * row_len);
    for &idx in beam_indices {
        out.extend_from_slice(&rows[idx as usize]);
    }
    Ok(Tensor::from_vec(
        out,
        (beam_indices.len(), heads, seq, dim),
        tensor.device(),
    )?)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn tensor_with_rows(rows: &[f32]) -> Tensor {
        // Two rows, each [1 head, 2 seq, 1 dim].
        Tensor::from_vec(rows.to_vec(), (2, 1, 2, 1), &Device::Cpu).unwrap()
    }

    #[test]
    fn gathers_rows_in_index_order() {
        let t = tensor_with_rows(&[1.0, 2.0, 3.0, 4.0]);
        let picked = gather_batch_beam(&t, &[1, 0, 1], 2).unwrap();
        assert_eq!(picked.dims(), &[3, 1, 2, 1]);
        let flat = picked.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(flat, vec![3.0, 4.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn identity_gather_is_a_copy() {
        let t = tensor_with_rows(&[1.0, 2.0, 3.0, 4.0]);
        let picked = gather_batch_beam(&t, &[0, 1], 2).unwrap();
        let flat = picked.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn rejects_out_of_range_index() {
        let t = tensor_with_rows(&[1.0, 2.0, 3.0, 4.0]);
        assert!(matches!(
            gather_batch_beam(&t, &[0, 2], 2),
            Err(CacheError::BeamIndex(2, 2))
        ));
        assert!(matches!(
            gather_batch_beam(&t, &[-1], 2),
            Err(CacheError::BeamIndex(-1, 2))
        ));
    }

    #[test]
    fn dispatches_on_half_dtypes() {
        let t = tensor_with_rows(&[1.0, 2.0, 3.0, 4.0])
            .to_dtype(DType::F16)
            .unwrap();
        let picked = gather_batch_beam(&t, &[1, 0], 2).unwrap();
        assert_eq!(picked.dtype(), DType::F16);
        let flat = picked
            .to_dtype(DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(flat, vec![3.0, 4.0, 1.0, 2.0]);
    }
}
