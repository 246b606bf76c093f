//! Packed token bitmasks and the batched parallel masker
//!
//! A [`TokenBitmask`] packs one bit per vocabulary position into `u32`
//! words, `ceil(vocab_size / 32)` words per row, one row per batch
//! element; bit `b` of word `w` set means token id `32*w + b` is
//! disallowed.
//!
//! The batched apply decomposes work into (row, block) units of
//! [`BLOCK_SIZE`] token positions each and hands them to rayon's
//! work-stealing scheduler: lanes that finish a unit immediately steal
//! the next one, which keeps every lane saturated regardless of the
//! row/block count ratio or uneven masked density. Each unit writes only
//! within its own row/block, so write sets are disjoint by construction
//! and no locking is needed.

use rayon::prelude::*;

use crate::error::{BozalError, Result};
use crate::grammar::GrammarEngine;

/// Bits per packed bitmask word
pub const BITS_PER_WORD: usize = 32;

/// Token positions covered by one (row, block) work unit
pub const BLOCK_SIZE: usize = 4096;

/// Number of packed words needed to cover `vocab_size` positions
#[must_use]
pub fn bitmask_words(vocab_size: usize) -> usize {
    (vocab_size + BITS_PER_WORD - 1) / BITS_PER_WORD
}

/// Packed per-row disallowed bitmask for a batch of logit rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBitmask {
    words: Vec<u32>,
    vocab_size: usize,
    num_rows: usize,
}

impl TokenBitmask {
    /// Allocate an all-zero (nothing disallowed) bitmask
    #[must_use]
    pub fn zeros(num_rows: usize, vocab_size: usize) -> Self {
        Self {
            words: vec![0; num_rows * bitmask_words(vocab_size)],
            vocab_size,
            num_rows,
        }
    }

    /// Vocabulary size each row covers
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Number of rows
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Packed words per row
    #[must_use]
    pub fn words_per_row(&self) -> usize {
        bitmask_words(self.vocab_size)
    }

    /// All rows as one flat word slice (row-major)
    #[must_use]
    pub fn as_words(&self) -> &[u32] {
        &self.words
    }

    /// Packed words of one row
    #[must_use]
    pub fn row(&self, row: usize) -> &[u32] {
        let wpr = self.words_per_row();
        &self.words[row * wpr..(row + 1) * wpr]
    }

    /// Mutable packed words of one row
    pub fn row_mut(&mut self, row: usize) -> &mut [u32] {
        let wpr = self.words_per_row();
        &mut self.words[row * wpr..(row + 1) * wpr]
    }

    /// Mark a token id as disallowed in one row
    pub fn set_disallowed(&mut self, row: usize, token_id: usize) {
        assert!(token_id < self.vocab_size, "token id out of vocabulary");
        let wpr = self.words_per_row();
        self.words[row * wpr + token_id / BITS_PER_WORD] |=
            1 << (token_id % BITS_PER_WORD);
    }

    /// Have `engine` write its current disallowed bitmask into `row`
    ///
    /// # Errors
    ///
    /// Returns [`BozalError::InvalidLength`] if the engine's vocabulary
    /// does not match this bitmask's.
    pub fn fill_row<E>(&mut self, row: usize, engine: &E) -> Result<()>
    where
        E: GrammarEngine + ?Sized,
    {
        if engine.vocab_size() != self.vocab_size {
            return Err(BozalError::InvalidLength {
                expected: engine.vocab_size(),
                actual: self.vocab_size,
            });
        }
        let words = self.row_mut(row);
        words.fill(0);
        engine.fill_bitmask(words);
        Ok(())
    }

    /// Decode one row back into its disallowed id list
    ///
    /// Mostly useful for diagnostics and for checking the parallel apply
    /// against the scalar masker.
    #[must_use]
    pub fn disallowed_ids(&self, row: usize) -> Vec<i64> {
        let mut out = Vec::new();
        for (w, &word) in self.row(row).iter().enumerate() {
            if word == 0 {
                continue;
            }
            for bit in 0..BITS_PER_WORD {
                let pos = w * BITS_PER_WORD + bit;
                if pos >= self.vocab_size {
                    break;
                }
                if (word >> bit) & 1 == 1 {
                    out.push(pos as i64);
                }
            }
        }
        out
    }
}

/// Unpack `words` over one block of positions, storing `-inf` per set
/// bit. `block.len()` bounds the final partial word.
fn apply_packed_words(block: &mut [f32], words: &[u32]) {
    for (w, &word) in words.iter().enumerate() {
        if word == 0 {
            continue;
        }
        let base = w * BITS_PER_WORD;
        let end = (base + BITS_PER_WORD).min(block.len());
        for bit in 0..end.saturating_sub(base) {
            if (word >> bit) & 1 == 1 {
                block[base + bit] = f32::NEG_INFINITY;
            }
        }
    }
}

/// Scalar reference apply: mask one logit row from its packed words
///
/// # Errors
///
/// Returns [`BozalError::InvalidLength`] if the row is shorter than
/// `vocab_size` and [`BozalError::InvalidShape`] on a word-count
/// mismatch.
pub fn apply_bitmask_row(logits: &mut [f32], words: &[u32], vocab_size: usize) -> Result<()> {
    if logits.len() < vocab_size {
        return Err(BozalError::InvalidLength {
            expected: vocab_size,
            actual: logits.len(),
        });
    }
    if words.len() != bitmask_words(vocab_size) {
        return Err(BozalError::InvalidShape {
            reason: format!(
                "bitmask has {} words, vocabulary of {} needs {}",
                words.len(),
                vocab_size,
                bitmask_words(vocab_size)
            ),
        });
    }
    apply_packed_words(&mut logits[..vocab_size], words);
    Ok(())
}

/// Apply a batch bitmask to `logits` in parallel, row by block.
///
/// `logits` holds `num_rows` rows of `vocab_size` values, row-major.
/// `row_indices` selects which batch rows to mask (identity when
/// `None`); row `i` of the bitmask masks row `i` of the batch. The call
/// returns once every selected position reflects the supplied bitmask;
/// there is no ordering guarantee across overlapping calls from
/// different threads.
///
/// # Errors
///
/// Returns [`BozalError::InvalidShape`] when the logits length is not
/// `num_rows * vocab_size`, the bitmask dimensions disagree, or an
/// index is out of range. Validation happens before any mutation.
pub fn apply_bitmask_batch(
    logits: &mut [f32],
    vocab_size: usize,
    bitmask: &TokenBitmask,
    row_indices: Option<&[u32]>,
) -> Result<()> {
    if bitmask.vocab_size() != vocab_size {
        return Err(BozalError::InvalidShape {
            reason: format!(
                "bitmask vocabulary {} does not match logits row length {}",
                bitmask.vocab_size(),
                vocab_size
            ),
        });
    }
    let num_rows = bitmask.num_rows();
    if vocab_size == 0 || logits.len() != num_rows * vocab_size {
        return Err(BozalError::InvalidShape {
            reason: format!(
                "expected {} rows of {} logits, got {} values",
                num_rows,
                vocab_size,
                logits.len()
            ),
        });
    }

    let selected: Vec<bool> = match row_indices {
        None => vec![true; num_rows],
        Some(indices) => {
            let mut selected = vec![false; num_rows];
            for &index in indices {
                let index = index as usize;
                if index >= num_rows {
                    return Err(BozalError::InvalidShape {
                        reason: format!("row index {index} out of range for {num_rows} rows"),
                    });
                }
                selected[index] = true;
            }
            selected
        }
    };

    logits
        .par_chunks_mut(vocab_size)
        .enumerate()
        .for_each(|(row, chunk)| {
            if !selected[row] {
                return;
            }
            let words = bitmask.row(row);
            chunk
                .par_chunks_mut(BLOCK_SIZE)
                .enumerate()
                .for_each(|(block, slice)| {
                    let word_base = block * BLOCK_SIZE / BITS_PER_WORD;
                    let word_count = bitmask_words(slice.len());
                    apply_packed_words(slice, &words[word_base..word_base + word_count]);
                });
        });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmask_words_rounding() {
        assert_eq!(bitmask_words(1), 1);
        assert_eq!(bitmask_words(32), 1);
        assert_eq!(bitmask_words(33), 2);
        assert_eq!(bitmask_words(40), 2);
        assert_eq!(bitmask_words(4096), 128);
    }

    #[test]
    fn test_set_and_decode_round_trip() {
        let mut mask = TokenBitmask::zeros(2, 70);
        mask.set_disallowed(0, 0);
        mask.set_disallowed(0, 33);
        mask.set_disallowed(1, 69);
        assert_eq!(mask.disallowed_ids(0), vec![0, 33]);
        assert_eq!(mask.disallowed_ids(1), vec![69]);
    }

    #[test]
    fn test_vocab_40_bits_0_and_39() {
        // ceil(40/32) = 2 words; bits 0 and 39 set ⇒ only positions 0
        // and 39 become -inf.
        let mut mask = TokenBitmask::zeros(1, 40);
        mask.set_disallowed(0, 0);
        mask.set_disallowed(0, 39);
        assert_eq!(mask.words_per_row(), 2);

        let mut logits = vec![1.0f32; 40];
        apply_bitmask_row(&mut logits, mask.row(0), 40).unwrap();
        for (i, &v) in logits.iter().enumerate() {
            if i == 0 || i == 39 {
                assert_eq!(v, f32::NEG_INFINITY, "position {i}");
            } else {
                assert_eq!(v, 1.0, "position {i}");
            }
        }
    }

    #[test]
    fn test_row_apply_word_count_mismatch() {
        let mut logits = vec![0.0f32; 40];
        let words = vec![0u32; 3];
        assert!(matches!(
            apply_bitmask_row(&mut logits, &words, 40).unwrap_err(),
            BozalError::InvalidShape { .. }
        ));
    }

    #[test]
    fn test_batch_apply_matches_scalar_rows() {
        let vocab = 100;
        let rows = 3;
        let mut mask = TokenBitmask::zeros(rows, vocab);
        for id in [0, 31, 32, 63, 64, 99] {
            mask.set_disallowed(0, id);
        }
        for id in 0..vocab {
            if id % 3 == 0 {
                mask.set_disallowed(2, id);
            }
        }

        let original: Vec<f32> = (0..rows * vocab).map(|i| i as f32 * 0.01).collect();

        let mut batched = original.clone();
        apply_bitmask_batch(&mut batched, vocab, &mask, None).unwrap();

        let mut scalar = original;
        for row in 0..rows {
            let slice = &mut scalar[row * vocab..(row + 1) * vocab];
            apply_bitmask_row(slice, mask.row(row), vocab).unwrap();
        }

        assert_eq!(batched, scalar);
    }

    #[test]
    fn test_batch_apply_respects_row_indices() {
        let vocab = 8;
        let mut mask = TokenBitmask::zeros(2, vocab);
        mask.set_disallowed(0, 1);
        mask.set_disallowed(1, 2);

        let mut logits = vec![1.0f32; 2 * vocab];
        apply_bitmask_batch(&mut logits, vocab, &mask, Some(&[1])).unwrap();

        // Row 0 untouched, row 1 masked at position 2
        assert!(logits[..vocab].iter().all(|v| *v == 1.0));
        assert_eq!(logits[vocab + 2], f32::NEG_INFINITY);
    }

    #[test]
    fn test_batch_apply_rejects_bad_index() {
        let vocab = 8;
        let mask = TokenBitmask::zeros(2, vocab);
        let mut logits = vec![0.0f32; 2 * vocab];
        assert!(apply_bitmask_batch(&mut logits, vocab, &mask, Some(&[5])).is_err());
    }

    #[test]
    fn test_batch_apply_rejects_length_mismatch() {
        let mask = TokenBitmask::zeros(2, 8);
        let mut logits = vec![0.0f32; 15];
        assert!(apply_bitmask_batch(&mut logits, 8, &mask, None).is_err());
    }

    #[test]
    fn test_large_row_spans_multiple_blocks() {
        // Exercise the (row, block) decomposition past one BLOCK_SIZE.
        let vocab = BLOCK_SIZE + 123;
        let mut mask = TokenBitmask::zeros(1, vocab);
        mask.set_disallowed(0, 0);
        mask.set_disallowed(0, BLOCK_SIZE - 1);
        mask.set_disallowed(0, BLOCK_SIZE);
        mask.set_disallowed(0, vocab - 1);

        let mut logits = vec![0.5f32; vocab];
        apply_bitmask_batch(&mut logits, vocab, &mask, None).unwrap();

        let masked: Vec<usize> = logits
            .iter()
            .enumerate()
            .filter(|(_, v)| **v == f32::NEG_INFINITY)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(masked, vec![0, BLOCK_SIZE - 1, BLOCK_SIZE, vocab - 1]);
    }
}
