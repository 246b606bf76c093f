//! Grammar engine boundary
//!
//! The grammar/parsing engine itself (token acceptance, grammar-state
//! transitions, allowed-id-set computation) lives outside this crate.
//! [`GrammarEngine`] is the trait it is consumed through: per decoding
//! step the engine reports an opaque [`Fingerprint`] for the current
//! allowed-set shape and writes id lists or a packed bitmask into
//! caller-supplied buffers. The masking core never interprets either.

use std::fmt;
use std::sync::Arc;

/// Opaque cache key identifying the current shape of the allowed-token-id
/// set.
///
/// Equality is engine-defined: two steps with an identical allowed set
/// must produce equal fingerprints. The bytes are never interpreted by
/// the masking core; they only feed `Eq`/`Hash` for cache lookups.
/// Cloning is cheap (shared allocation).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Arc<[u8]>);

impl Fingerprint {
    /// Build a fingerprint from engine-produced bytes
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }

    /// Build a fingerprint from a 64-bit value
    ///
    /// Convenience for engines that already hash their allowed set.
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        Self(Arc::from(value.to_le_bytes().as_slice()))
    }

    /// Raw fingerprint bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(")?;
        for byte in self.0.iter().take(8) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 8 {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

/// Outcome of offering a token to the grammar engine.
///
/// Rejection is a value, not an error: masking and acceptance are
/// separate concerns, and masking never fails due to grammar rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptResult {
    /// Token accepted; generation continues under the grammar
    Ongoing,
    /// Token accepted and the grammar reached a terminal state
    Finished,
    /// Token not currently permitted by the grammar; state unchanged
    Rejected,
}

impl AcceptResult {
    /// Whether the token was accepted (ongoing or finished)
    #[must_use]
    pub fn is_accepted(self) -> bool {
        !matches!(self, AcceptResult::Rejected)
    }
}

/// Interface the masking core consumes from a grammar engine.
///
/// One implementor per grammar backend. All id buffers use `i64`
/// elements and all bitmask buffers use packed `u32` words with bit `b`
/// of word `w` encoding "token id `32*w + b` is disallowed" (bit set ⇒
/// disallowed).
///
/// Count/write contract: `write_allowed_ids` must be called with a
/// buffer of exactly [`allowed_count`](GrammarEngine::allowed_count)
/// elements, and `write_disallowed_ids` with exactly
/// [`disallowed_count`](GrammarEngine::disallowed_count) elements, both
/// as of the last computation. The core sizes buffers exactly to the
/// reported counts and never reads or writes past them.
pub trait GrammarEngine {
    /// Recompute the allowed-token-id set for the current grammar state
    fn compute_allowed_token_ids(&mut self) -> AcceptResult;

    /// Fingerprint of the allowed set from the last computation
    fn allowed_set_fingerprint(&self) -> Fingerprint;

    /// Number of currently allowed token ids
    fn allowed_count(&self) -> usize;

    /// Number of currently disallowed token ids
    fn disallowed_count(&self) -> usize;

    /// Write the allowed token ids into `buf`
    ///
    /// `buf.len()` must equal [`allowed_count`](GrammarEngine::allowed_count).
    fn write_allowed_ids(&self, buf: &mut [i64]);

    /// Write the disallowed token ids into `buf`
    ///
    /// `buf.len()` must equal
    /// [`disallowed_count`](GrammarEngine::disallowed_count).
    fn write_disallowed_ids(&self, buf: &mut [i64]);

    /// Write the packed disallowed bitmask into `words`
    ///
    /// `words.len()` must equal `ceil(vocab_size / 32)`; bit set ⇒
    /// disallowed.
    fn fill_bitmask(&self, words: &mut [u32]);

    /// Offer a token to the grammar; does NOT recompute the allowed set
    fn try_accept_token(&mut self, token_id: u32) -> AcceptResult;

    /// Whether the grammar reached a terminal state
    fn is_finished(&self) -> bool;

    /// Return the engine to its initial grammar state
    fn reset(&mut self);

    /// Release internal scratch memory where possible
    fn shrink_to_fit(&mut self) {}

    /// Size of the vocabulary this engine was built over
    fn vocab_size(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_equality() {
        let a = Fingerprint::from_bytes(&[1, 2, 3]);
        let b = Fingerprint::from_bytes(&[1, 2, 3]);
        let c = Fingerprint::from_bytes(&[1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_from_u64() {
        let a = Fingerprint::from_u64(42);
        let b = Fingerprint::from_u64(42);
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), 8);
    }

    #[test]
    fn test_fingerprint_hashable() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(Fingerprint::from_u64(1), "one");
        assert_eq!(map.get(&Fingerprint::from_u64(1)), Some(&"one"));
        assert_eq!(map.get(&Fingerprint::from_u64(2)), None);
    }

    #[test]
    fn test_fingerprint_debug_truncates() {
        let fp = Fingerprint::from_bytes(&[0xab; 16]);
        let rendered = format!("{fp:?}");
        assert!(rendered.contains("abababab"));
        assert!(rendered.contains(".."));
    }

    #[test]
    fn test_accept_result_is_accepted() {
        assert!(AcceptResult::Ongoing.is_accepted());
        assert!(AcceptResult::Finished.is_accepted());
        assert!(!AcceptResult::Rejected.is_accepted());
    }
}
