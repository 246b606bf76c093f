//! Fingerprint-keyed index buffer cache
//!
//! Grammars tend to revisit a small number of allowed-set shapes over a
//! decode. The cache maps each shape's [`Fingerprint`] to a pair of
//! precomputed token-id buffers (disallowed, allowed) so consecutive
//! steps that report the same fingerprint skip the id extraction
//! entirely. Entries are never partially constructed: either both
//! buffers exist and are sized exactly to the engine's reported counts,
//! or no entry exists.
//!
//! There is no eviction policy. Growth is bounded by the number of
//! distinct shapes the grammar produces; callers needing bounded memory
//! clear the cache through the owning engine wrapper.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::adapter::ID_ALIGN;
use crate::error::{BozalError, Result};
use crate::grammar::{Fingerprint, GrammarEngine};
use crate::verbose;

/// Allocation strategy for a cache entry's index buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocMode {
    /// Ordinary host allocation
    Plain,
    /// Page-locked host allocation for non-blocking device transfer
    Pinned,
}

/// Host buffer tagged with its allocation strategy
///
/// Pinned memory allows DMA transfers to an accelerator without an
/// intermediate staging copy. True page-locked allocation requires
/// driver support; this currently falls back to an ordinary aligned
/// allocation and records the requested mode, so the transfer path
/// still works, just without the DMA fast path.
#[derive(Debug)]
pub struct PinnedHostBuffer<T> {
    data: Vec<T>,
    mode: AllocMode,
    is_pinned: bool,
}

impl<T: Copy + Default> PinnedHostBuffer<T> {
    /// Allocate a zero-initialized buffer of `len` elements
    #[must_use]
    pub fn new(len: usize, mode: AllocMode) -> Self {
        let data = vec![T::default(); len];
        Self {
            data,
            mode,
            is_pinned: false,
        }
    }

    /// Borrow the contents
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mutably borrow the contents
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Requested allocation mode
    #[must_use]
    pub fn mode(&self) -> AllocMode {
        self.mode
    }

    /// Whether the allocation is truly page-locked
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.is_pinned
    }

    /// Size in bytes
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }
}

/// Immutable ordered token-id buffer owned by a cache entry
#[derive(Debug)]
pub struct IdBuffer {
    buf: PinnedHostBuffer<i64>,
}

impl IdBuffer {
    /// Allocate `len` ids and let `write` fill them (typically the
    /// engine's `write_allowed_ids` / `write_disallowed_ids`).
    ///
    /// # Errors
    ///
    /// Returns [`BozalError::Misaligned`] if the allocation violates the
    /// 8-byte id alignment contract (defensive; indicates a broken
    /// allocator).
    pub fn build<F>(len: usize, mode: AllocMode, write: F) -> Result<Self>
    where
        F: FnOnce(&mut [i64]),
    {
        let mut buf = PinnedHostBuffer::new(len, mode);
        let addr = buf.as_slice().as_ptr() as usize;
        if addr % ID_ALIGN != 0 {
            return Err(BozalError::Misaligned {
                addr,
                required: ID_ALIGN,
            });
        }
        write(buf.as_mut_slice());
        Ok(Self { buf })
    }

    /// The token ids
    #[must_use]
    pub fn ids(&self) -> &[i64] {
        self.buf.as_slice()
    }

    /// Number of ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer holds no ids
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Allocation mode chosen when the owning entry was built
    #[must_use]
    pub fn mode(&self) -> AllocMode {
        self.buf.mode()
    }
}

/// One cached (disallowed, allowed) index buffer pair
#[derive(Debug)]
pub struct CacheEntry {
    disallowed: IdBuffer,
    allowed: IdBuffer,
}

impl CacheEntry {
    /// Ids the grammar currently forbids
    #[must_use]
    pub fn disallowed(&self) -> &IdBuffer {
        &self.disallowed
    }

    /// Ids the grammar currently permits
    #[must_use]
    pub fn allowed(&self) -> &IdBuffer {
        &self.allowed
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of distinct fingerprints cached
    pub entries: usize,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that had to build a new entry
    pub misses: u64,
    /// Total bytes held by cached id buffers
    pub index_bytes: usize,
}

impl CacheStats {
    /// Hit rate in `[0.0, 1.0]`; `0.0` when no lookups happened
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Fingerprint-keyed cache of index buffer pairs
///
/// Accessed from a single logical decoding stream per engine instance;
/// callers masking against the same engine from multiple threads must
/// serialize access themselves.
#[derive(Debug, Default)]
pub struct IdSetCache {
    entries: HashMap<Fingerprint, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl IdSetCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the index buffer pair for `fingerprint`, building it from
    /// the engine's current id set on a miss.
    ///
    /// Returns `Ok(None)` when the engine reports zero disallowed ids:
    /// no masking is needed at all, and no allocation is made (the
    /// native transfer boundary disallows zero-length buffers, and an
    /// entry would never be consulted anyway).
    ///
    /// `mode` is honored only when the entry is first built; a hit
    /// returns the existing buffers even if their allocation mode
    /// differs from the current destination. Re-pinning on placement
    /// change is deliberately not done — a known staleness/inefficiency
    /// trade-off, not a correctness issue.
    ///
    /// # Errors
    ///
    /// Returns [`BozalError::Misaligned`] if an id allocation violates
    /// the alignment contract.
    pub fn resolve<E>(
        &mut self,
        fingerprint: Fingerprint,
        engine: &E,
        mode: AllocMode,
    ) -> Result<Option<&CacheEntry>>
    where
        E: GrammarEngine + ?Sized,
    {
        if self.entries.contains_key(&fingerprint) {
            self.hits += 1;
            return Ok(self.entries.get(&fingerprint));
        }

        let disallowed_count = engine.disallowed_count();
        if disallowed_count == 0 {
            return Ok(None);
        }
        let allowed_count = engine.allowed_count();
        if verbose() {
            eprintln!(
                "[mask-cache] miss: building {disallowed_count} disallowed + {allowed_count} allowed ids ({mode:?})"
            );
        }

        // Buffers are sized exactly to the reported counts; the engine's
        // counts are trusted per its write contract.
        let disallowed = IdBuffer::build(disallowed_count, mode, |buf| {
            engine.write_disallowed_ids(buf);
        })?;
        let allowed = IdBuffer::build(allowed_count, mode, |buf| {
            engine.write_allowed_ids(buf);
        })?;

        self.misses += 1;
        let entry = self
            .entries
            .entry(fingerprint)
            .or_insert(CacheEntry { disallowed, allowed });
        Ok(Some(entry))
    }

    /// Look up an entry without building on miss
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&CacheEntry> {
        self.entries.get(fingerprint)
    }

    /// Number of cached fingerprints
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discard every entry and reset the hit/miss counters
    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits = 0;
        self.misses = 0;
    }

    /// Snapshot of cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let index_bytes = self
            .entries
            .values()
            .map(|e| (e.disallowed.len() + e.allowed.len()) * std::mem::size_of::<i64>())
            .sum();
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            index_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockGrammarEngine;

    #[test]
    fn test_miss_builds_exactly_sized_buffers() {
        let engine = MockGrammarEngine::with_disallowed(8, &[1, 3, 5]);
        let mut cache = IdSetCache::new();
        let entry = cache
            .resolve(engine.allowed_set_fingerprint(), &engine, AllocMode::Plain)
            .unwrap()
            .expect("nonzero disallowed set");
        assert_eq!(entry.disallowed().ids(), &[1, 3, 5]);
        assert_eq!(entry.allowed().ids(), &[0, 2, 4, 6, 7]);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_hit_reuses_buffer_identity() {
        let engine = MockGrammarEngine::with_disallowed(16, &[2, 9]);
        let mut cache = IdSetCache::new();
        let fp = engine.allowed_set_fingerprint();

        let first = cache
            .resolve(fp.clone(), &engine, AllocMode::Plain)
            .unwrap()
            .unwrap();
        let first_ptr = first.disallowed().ids().as_ptr();

        let second = cache
            .resolve(fp, &engine, AllocMode::Plain)
            .unwrap()
            .unwrap();
        assert!(std::ptr::eq(first_ptr, second.disallowed().ids().as_ptr()));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_distinct_fingerprints_do_not_corrupt_prior_entry() {
        let mut engine = MockGrammarEngine::with_disallowed(8, &[1, 3, 5]);
        let mut cache = IdSetCache::new();
        let fp_a = engine.allowed_set_fingerprint();
        cache
            .resolve(fp_a.clone(), &engine, AllocMode::Plain)
            .unwrap();

        engine.set_disallowed(&[0, 7]);
        let fp_b = engine.allowed_set_fingerprint();
        assert_ne!(fp_a, fp_b);
        cache.resolve(fp_b, &engine, AllocMode::Plain).unwrap();

        assert_eq!(cache.len(), 2);
        let prior = cache.get(&fp_a).unwrap();
        assert_eq!(prior.disallowed().ids(), &[1, 3, 5]);
    }

    #[test]
    fn test_zero_disallowed_short_circuits_without_entry() {
        let engine = MockGrammarEngine::allow_all(32);
        let mut cache = IdSetCache::new();
        let resolved = cache
            .resolve(engine.allowed_set_fingerprint(), &engine, AllocMode::Plain)
            .unwrap();
        assert!(resolved.is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_fully_disallowed_set_is_representable() {
        // allowed_count == 0 must still build a valid entry: a
        // zero-length allowed buffer is fine at the slice boundary.
        let engine = MockGrammarEngine::with_allowed(4, &[]);
        let mut cache = IdSetCache::new();
        let entry = cache
            .resolve(engine.allowed_set_fingerprint(), &engine, AllocMode::Plain)
            .unwrap()
            .unwrap();
        assert_eq!(entry.disallowed().len(), 4);
        assert!(entry.allowed().is_empty());
    }

    #[test]
    fn test_alloc_mode_recorded_per_entry() {
        let engine = MockGrammarEngine::with_disallowed(8, &[0]);
        let mut cache = IdSetCache::new();
        let entry = cache
            .resolve(engine.allowed_set_fingerprint(), &engine, AllocMode::Pinned)
            .unwrap()
            .unwrap();
        assert_eq!(entry.disallowed().mode(), AllocMode::Pinned);
        assert_eq!(entry.allowed().mode(), AllocMode::Pinned);
    }

    #[test]
    fn test_clear_discards_entries_and_counters() {
        let engine = MockGrammarEngine::with_disallowed(8, &[1]);
        let mut cache = IdSetCache::new();
        cache
            .resolve(engine.allowed_set_fingerprint(), &engine, AllocMode::Plain)
            .unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().index_bytes, 0);
    }

    #[test]
    fn test_stats_hit_rate() {
        let stats = CacheStats {
            entries: 1,
            hits: 3,
            misses: 1,
            index_bytes: 64,
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
