//! Token history store for every batch-beam row of a generation.
//!
//! A dense `[batch_beam, max_length]` buffer plus one shared current length.
//! Rows only hold meaningful data in `[0, len)`; the tail is undefined.

use crate::error::GeneratorError;

pub struct Sequences {
    buf: Vec<i32>,
    /// Reorder target for `append_beam`; swapped with `buf` after each use.
    scratch: Vec<i32>,
    batch_beam_size: usize,
    max_length: usize,
    len: usize,
}

impl Sequences {
    /// Build the store from a dense `[batch_size, prompt_len]` prompt,
    /// replicating each batch row across its beams.
    pub fn from_prompt(
        prompt: &[i32],
        batch_size: usize,
        num_beams: usize,
        max_length: usize,
    ) -> Result<Self, GeneratorError> {
        if prompt.is_empty() || prompt.len() % batch_size != 0 {
            return Err(GeneratorError::ConfigInvalid(format!(
                "prompt of {} tokens does not divide into batch_size {}",
                prompt.len(),
                batch_size
            )));
        }
        let prompt_len = prompt.len() / batch_size;
        if prompt_len >= max_length {
            return Err(GeneratorError::ConfigInvalid(format!(
                "prompt length {prompt_len} leaves no room below max_length {max_length}"
            )));
        }

        let batch_beam_size = batch_size * num_beams;
        let mut buf = vec![0i32; batch_beam_size * max_length];
        for batch in 0..batch_size {
            let src = &prompt[batch * prompt_len..(batch + 1) * prompt_len];
            for beam in 0..num_beams {
                let row = batch * num_beams + beam;
                buf[row * max_length..row * max_length + prompt_len].copy_from_slice(src);
            }
        }
        Ok(Self {
            scratch: vec![0i32; buf.len()],
            buf,
            batch_beam_size,
            max_length,
            len: prompt_len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn batch_beam_size(&self) -> usize {
        self.batch_beam_size
    }

    /// The meaningful prefix `[0, len)` of row `row`.
    pub fn sequence(&self, row: usize) -> &[i32] {
        let start = row * self.max_length;
        &self.buf[start..start + self.len]
    }

    /// Append one token per row.
    pub fn append(&mut self, next_tokens: &[i32]) -> Result<(), GeneratorError> {
        debug_assert_eq!(next_tokens.len(), self.batch_beam_size);
        if self.len == self.max_length {
            return Err(GeneratorError::OutOfSpace(self.len));
        }
        for (row, &token) in next_tokens.iter().enumerate() {
            self.buf[row * self.max_length + self.len] = token;
        }
        self.len += 1;
        Ok(())
    }

    /// Reorder rows to follow beam promotions, then append one token per row.
    ///
    /// Row `r` becomes a copy of the pre-call row `next_indices[r]` with
    /// `next_tokens[r]` appended. The copy goes through a scratch buffer so
    /// every destination reads consistent source data.
    pub fn append_beam(
        &mut self,
        next_indices: &[i32],
        next_tokens: &[i32],
    ) -> Result<(), GeneratorError> {
        debug_assert_eq!(next_indices.len(), self.batch_beam_size);
        debug_assert_eq!(next_tokens.len(), self.batch_beam_size);
        if self.len == self.max_length {
            return Err(GeneratorError::OutOfSpace(self.len));
        }
        for row in 0..self.batch_beam_size {
            let src = next_indices[row] as usize * self.max_length;
            let dst = row * self.max_length;
            self.scratch[dst..dst + self.len]
                .copy_from_slice(&self.buf[src..src + self.len]);
            self.scratch[dst + self.len] = next_tokens[row];
        }
        std::mem::swap(&mut self.buf, &mut self.scratch);
        self.len += 1;
        Ok(())
    }

    /// Truncate the last `n` tokens from every row.
    pub fn drop_last(&mut self, n: usize) -> Result<(), GeneratorError> {
        if n > self.len {
            return Err(GeneratorError::ConfigInvalid(format!(
                "cannot drop {n} tokens from sequences of length {}",
                self.len
            )));
        }
        self.len -= n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Sequences {
        Sequences::from_prompt(&[1, 2, 3, 4], 2, 1, 8).unwrap()
    }

    #[test]
    fn prompt_is_replicated_across_beams() {
        let seqs = Sequences::from_prompt(&[7, 8], 1, 3, 8).unwrap();
        assert_eq!(seqs.len(), 2);
        for row in 0..3 {
            assert_eq!(seqs.sequence(row), &[7, 8]);
        }
    }

    #[test]
    fn append_advances_every_row() {
        let mut seqs = store();
        seqs.append(&[10, 20]).unwrap();
        assert_eq!(seqs.len(), 3);
        assert_eq!(seqs.sequence(0), &[1, 2, 10]);
        assert_eq!(seqs.sequence(1), &[3, 4, 20]);
    }

    #[test]
    fn append_fails_when_full() {
        let mut seqs = Sequences::from_prompt(&[1], 1, 1, 2).unwrap();
        seqs.append(&[2]).unwrap();
        assert!(matches!(
            seqs.append(&[3]),
            Err(GeneratorError::OutOfSpace(2))
        ));
    }

    #[test]
    fn beam_append_reorders_history() {
        let mut seqs = Sequences::from_prompt(&[5], 1, 2, 8).unwrap();
        seqs.append(&[1, 2]).unwrap(); // rows: [5,1] [5,2]
        seqs.append_beam(&[1, 1], &[30, 40]).unwrap();
        assert_eq!(seqs.sequence(0), &[5, 2, 30]);
        assert_eq!(seqs.sequence(1), &[5, 2, 40]);
    }

    #[test]
    fn beam_append_preserves_prefix() {
        let mut seqs = Sequences::from_prompt(&[5], 1, 2, 8).unwrap();
        seqs.append(&[1, 2]).unwrap();
        let before: Vec<Vec<i32>> = (0..2).map(|r| seqs.sequence(r).to_vec()).collect();
        seqs.append_beam(&[1, 0], &[9, 9]).unwrap();
        assert_eq!(&seqs.sequence(0)[..2], before[1].as_slice());
        assert_eq!(&seqs.sequence(1)[..2], before[0].as_slice());
    }

    #[test]
    fn drop_last_then_append_round_trips() {
        let mut seqs = store();
        seqs.append(&[10, 20]).unwrap();
        seqs.drop_last(1).unwrap();
        assert_eq!(seqs.len(), 2);
        seqs.append(&[11, 21]).unwrap();
        assert_eq!(seqs.sequence(0), &[1, 2, 11]);
    }

    #[test]
    fn drop_more_than_len_is_rejected() {
        let mut seqs = store();
        assert!(seqs.drop_last(3).is_err());
    }

    #[test]
    fn rejects_prompt_at_max_length() {
        assert!(Sequences::from_prompt(&[1, 2], 1, 1, 2).is_err());
    }
}
