//! Caller-facing masking engine
//!
//! [`MaskingEngine`] wraps a grammar engine together with its
//! fingerprint-keyed index cache and drives one decoding step's masking:
//! adapter normalization, cache resolution, strategy selection, and the
//! in-place scalar mutation. [`mask_batch`] is the batched entry point
//! that routes per-engine bitmasks through the parallel masker.
//!
//! The wrapper owns the cache, so its lifetime — and the explicit
//! [`reset`](MaskingEngine::reset) /
//! [`shrink_to_fit`](MaskingEngine::shrink_to_fit) clears — bound the
//! cache's memory.

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::adapter::{convert_logits, BufferView, Placement};
use crate::bitmask::{apply_bitmask_batch, bitmask_words, TokenBitmask};
use crate::cache::{AllocMode, CacheStats, IdSetCache};
use crate::error::{BozalError, Result};
use crate::grammar::{AcceptResult, GrammarEngine};
use crate::mask::{apply_strategy, select_strategy, MaskStrategy};

/// Tunables for a [`MaskingEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaskConfig {
    /// Strategy override; `None` selects by cost per call
    pub force_strategy: Option<MaskStrategy>,
    /// Request pinned host memory for index buffers built while the
    /// destination logits are device-resident
    pub use_pinned_index_buffers: bool,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            force_strategy: None,
            use_pinned_index_buffers: true,
        }
    }
}

/// A grammar engine paired with its index cache and masking entry points
///
/// # Examples
///
/// ```
/// use bozal::engine::MaskingEngine;
/// use bozal::testing::MockGrammarEngine;
///
/// let grammar = MockGrammarEngine::with_disallowed(8, &[1, 3, 5]);
/// let mut engine = MaskingEngine::new(grammar);
///
/// let mut logits = vec![0.5f32; 8];
/// engine.mask(&mut logits).unwrap();
/// assert_eq!(logits[1], f32::NEG_INFINITY);
/// assert_eq!(logits[0], 0.5);
/// ```
#[derive(Debug)]
pub struct MaskingEngine<E: GrammarEngine> {
    engine: E,
    cache: IdSetCache,
    config: MaskConfig,
}

impl<E: GrammarEngine> MaskingEngine<E> {
    /// Wrap `engine` with an empty cache and default configuration
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, MaskConfig::default())
    }

    /// Wrap `engine` with an explicit configuration
    pub fn with_config(engine: E, config: MaskConfig) -> Self {
        Self {
            engine,
            cache: IdSetCache::new(),
            config,
        }
    }

    /// Borrow the wrapped grammar engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Mutably borrow the wrapped grammar engine
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Unwrap, discarding the cache
    pub fn into_inner(self) -> E {
        self.engine
    }

    /// Vocabulary size of the wrapped engine
    pub fn vocab_size(&self) -> usize {
        self.engine.vocab_size()
    }

    /// Whether the wrapped grammar reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.engine.is_finished()
    }

    /// Recompute the allowed set for the current grammar state
    pub fn compute_allowed_token_ids(&mut self) -> AcceptResult {
        self.engine.compute_allowed_token_ids()
    }

    /// Offer a token without recomputing the allowed set
    pub fn try_accept_token(&mut self, token_id: u32) -> AcceptResult {
        self.engine.try_accept_token(token_id)
    }

    /// Whether `token_id` is permitted by the last computed allowed set
    ///
    /// Diagnostics helper; rebuilds a one-row bitmask per call.
    pub fn is_token_allowed(&self, token_id: u32) -> bool {
        let vocab = self.engine.vocab_size();
        if token_id as usize >= vocab {
            return false;
        }
        let mut words = vec![0u32; bitmask_words(vocab)];
        self.engine.fill_bitmask(&mut words);
        let id = token_id as usize;
        (words[id / 32] >> (id % 32)) & 1 == 0
    }

    /// Mask an opaque logits handle in place against the last computed
    /// allowed set.
    ///
    /// The handle is normalized through the converter registry first;
    /// handles that required conversion (e.g. `f64` storage) hold the
    /// masked result afterwards in normalized form. With zero disallowed
    /// ids this is a no-op and the handle's contents are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`BozalError::UnsupportedType`] for unrecognized handles,
    /// [`BozalError::InvalidShape`] / [`BozalError::Misaligned`] from
    /// the adapter, and [`BozalError::InvalidLength`] when the buffer is
    /// shorter than the engine's vocabulary. Errors are detected before
    /// any mutation.
    pub fn mask(&mut self, logits: &mut dyn Any) -> Result<()> {
        let view = convert_logits(logits)?;
        self.mask_view(view)
    }

    /// Mask a plain host `f32` slice in place
    ///
    /// Same semantics as [`mask`](MaskingEngine::mask) without the
    /// registry round-trip.
    ///
    /// # Errors
    ///
    /// See [`mask`](MaskingEngine::mask).
    pub fn mask_slice(&mut self, logits: &mut [f32]) -> Result<()> {
        let view = BufferView::from_slice(logits)?;
        self.mask_view(view)
    }

    /// Mask a normalized buffer view in place
    ///
    /// # Errors
    ///
    /// See [`mask`](MaskingEngine::mask).
    pub fn mask_view(&mut self, mut view: BufferView<'_>) -> Result<()> {
        let vocab = self.engine.vocab_size();
        if view.len() < vocab {
            return Err(BozalError::InvalidLength {
                expected: vocab,
                actual: view.len(),
            });
        }

        let mode = match view.placement() {
            Placement::Accelerator if self.config.use_pinned_index_buffers => AllocMode::Pinned,
            _ => AllocMode::Plain,
        };
        let fingerprint = self.engine.allowed_set_fingerprint();
        let Some(entry) = self.cache.resolve(fingerprint, &self.engine, mode)? else {
            // Zero disallowed ids: nothing to mask.
            return Ok(());
        };

        let logits = view.as_mut_slice();
        let strategy = self
            .config
            .force_strategy
            .unwrap_or_else(|| select_strategy(entry.disallowed().len(), logits.len()));
        let ids = match strategy {
            MaskStrategy::SuppressDisallowed => entry.disallowed().ids(),
            MaskStrategy::KeepAllowed => entry.allowed().ids(),
        };
        apply_strategy(logits, strategy, ids)
    }

    /// Accept `token_id` and, if generation is still ongoing, recompute
    /// the allowed set and mask `logits` in place.
    ///
    /// Rejection and termination are reported as values with the logits
    /// untouched; masking and acceptance are separate concerns.
    ///
    /// # Errors
    ///
    /// Same buffer errors as [`mask`](MaskingEngine::mask); never fails
    /// due to grammar rejection.
    pub fn update(&mut self, token_id: u32, logits: &mut dyn Any) -> Result<AcceptResult> {
        match self.engine.try_accept_token(token_id) {
            AcceptResult::Rejected => Ok(AcceptResult::Rejected),
            AcceptResult::Finished => Ok(AcceptResult::Finished),
            AcceptResult::Ongoing => {
                let result = self.engine.compute_allowed_token_ids();
                self.mask(logits)?;
                Ok(result)
            }
        }
    }

    /// Reset the grammar to its initial state and discard the cache
    pub fn reset(&mut self) {
        self.engine.reset();
        self.cache.clear();
    }

    /// Discard the cache and release engine scratch memory
    pub fn shrink_to_fit(&mut self) {
        self.cache.clear();
        self.engine.shrink_to_fit();
    }

    /// Snapshot of the index cache's statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Fill one bitmask row per engine, then apply the batch bitmask to
/// `logits` through the parallel masker.
///
/// `logits` holds `engines.len()` rows of `vocab_size` values,
/// row-major; engine `i` constrains batch row `i`. `row_indices`
/// optionally restricts the apply to a subset of rows. The bitmask is
/// caller-supplied so its allocation can be reused across steps.
///
/// # Errors
///
/// Returns [`BozalError::InvalidShape`] /
/// [`BozalError::InvalidLength`] on dimension mismatches between the
/// logits, bitmask, and engines. Validation happens before any
/// mutation.
pub fn mask_batch(
    logits: &mut [f32],
    vocab_size: usize,
    bitmask: &mut TokenBitmask,
    engines: &[&dyn GrammarEngine],
    row_indices: Option<&[u32]>,
) -> Result<()> {
    if engines.len() != bitmask.num_rows() {
        return Err(BozalError::InvalidShape {
            reason: format!(
                "{} engines for a bitmask of {} rows",
                engines.len(),
                bitmask.num_rows()
            ),
        });
    }
    for (row, engine) in engines.iter().enumerate() {
        bitmask.fill_row(row, *engine)?;
    }
    apply_bitmask_batch(logits, vocab_size, bitmask, row_indices)
}
