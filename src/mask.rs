//! Scalar masking and strategy selection
//!
//! Masking writes IEEE754 `-inf` (never a finite sentinel) at the
//! disallowed vocabulary positions so downstream softmax assigns them
//! exactly zero probability. Two strategies cover the two regimes a
//! grammar produces:
//!
//! - **suppress-disallowed**: write `-inf` at each disallowed position,
//!   cost ∝ `disallowed_count`. Wins in unconstrained regions where
//!   almost everything is allowed.
//! - **keep-allowed**: fill the row with `-inf`, then scatter the
//!   original values back at the allowed positions, cost dominated by
//!   the allowed scatter. Wins under tight constraints where a grammar
//!   disallows the overwhelming majority of a large vocabulary.
//!
//! Always picking the cheaper side bounds the scatter work by
//! `min(disallowed_count, allowed_count)` instead of `vocab_size`.
//! Both paths produce bit-identical results and are idempotent.

use serde::{Deserialize, Serialize};

use crate::error::{BozalError, Result};

/// Which masking approach to apply to a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskStrategy {
    /// Write `-inf` at exactly the disallowed positions
    SuppressDisallowed,
    /// Fill with `-inf`, scatter originals back at allowed positions
    KeepAllowed,
}

/// Pick the cheaper masking strategy for a row of `vocab_size` logits
///
/// Suppression is chosen while `disallowed_count <= vocab_size / 2`;
/// beyond that the keep-allowed path touches fewer positions.
#[must_use]
pub fn select_strategy(disallowed_count: usize, vocab_size: usize) -> MaskStrategy {
    if disallowed_count <= vocab_size / 2 {
        MaskStrategy::SuppressDisallowed
    } else {
        MaskStrategy::KeepAllowed
    }
}

/// Validate that every id addresses a position inside `len` logits.
///
/// Runs before any mutation so a rejected call never leaves the buffer
/// partially masked.
fn validate_ids(ids: &[i64], len: usize) -> Result<()> {
    for &id in ids {
        if id < 0 || id as usize >= len {
            return Err(BozalError::InvalidLength {
                expected: (id.max(0) as usize) + 1,
                actual: len,
            });
        }
    }
    Ok(())
}

/// Write `-inf` at each position in `disallowed`, leaving everything
/// else untouched.
///
/// Single-threaded sequential writes; idempotent.
///
/// # Errors
///
/// Returns [`BozalError::InvalidLength`] (before any write) if an id
/// falls outside the buffer.
pub fn suppress_disallowed(logits: &mut [f32], disallowed: &[i64]) -> Result<()> {
    validate_ids(disallowed, logits.len())?;
    for &id in disallowed {
        logits[id as usize] = f32::NEG_INFINITY;
    }
    Ok(())
}

/// Rescue the values at `allowed`, fill the row with `-inf`, then
/// scatter the rescued values back.
///
/// Scratch is sized to `allowed.len()`, not the vocabulary. An empty
/// allowed set is valid and yields an all-`-inf` row.
///
/// # Errors
///
/// Returns [`BozalError::InvalidLength`] (before any write) if an id
/// falls outside the buffer.
pub fn keep_allowed(logits: &mut [f32], allowed: &[i64]) -> Result<()> {
    validate_ids(allowed, logits.len())?;
    let rescued: Vec<f32> = allowed.iter().map(|&id| logits[id as usize]).collect();
    logits.fill(f32::NEG_INFINITY);
    for (&id, &value) in allowed.iter().zip(&rescued) {
        logits[id as usize] = value;
    }
    Ok(())
}

/// Apply `strategy` to one row using the matching id list
///
/// `ids` must be the disallowed list for
/// [`MaskStrategy::SuppressDisallowed`] and the allowed list for
/// [`MaskStrategy::KeepAllowed`].
///
/// # Errors
///
/// Returns [`BozalError::InvalidLength`] if an id falls outside the
/// buffer.
pub fn apply_strategy(logits: &mut [f32], strategy: MaskStrategy, ids: &[i64]) -> Result<()> {
    match strategy {
        MaskStrategy::SuppressDisallowed => suppress_disallowed(logits, ids),
        MaskStrategy::KeepAllowed => keep_allowed(logits, ids),
    }
}
