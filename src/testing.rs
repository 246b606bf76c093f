//! Test support: a scriptable in-memory grammar engine
//!
//! [`MockGrammarEngine`] implements [`GrammarEngine`] over an explicit
//! allowed-token set. It exists so unit tests, integration tests, and
//! benchmarks can exercise the masking core without a real parsing
//! backend, and so downstream crates can test their own integration the
//! same way. Fingerprints are content-addressed over the allowed set,
//! mirroring how real engines derive them, so repeated shapes genuinely
//! collide in the cache.

use crate::bitmask::bitmask_words;
use crate::grammar::{AcceptResult, Fingerprint, GrammarEngine};

/// Grammar engine stand-in backed by an explicit allowed-token set
#[derive(Debug, Clone)]
pub struct MockGrammarEngine {
    vocab_size: usize,
    allowed: Vec<bool>,
    initial: Vec<bool>,
    finished: bool,
    finish_on_accept: bool,
}

impl MockGrammarEngine {
    fn from_allowed(vocab_size: usize, allowed: Vec<bool>) -> Self {
        Self {
            vocab_size,
            initial: allowed.clone(),
            allowed,
            finished: false,
            finish_on_accept: false,
        }
    }

    /// Engine that allows every token id
    #[must_use]
    pub fn allow_all(vocab_size: usize) -> Self {
        Self::from_allowed(vocab_size, vec![true; vocab_size])
    }

    /// Engine that allows exactly `allowed_ids`
    #[must_use]
    pub fn with_allowed(vocab_size: usize, allowed_ids: &[u32]) -> Self {
        let mut allowed = vec![false; vocab_size];
        for &id in allowed_ids {
            allowed[id as usize] = true;
        }
        Self::from_allowed(vocab_size, allowed)
    }

    /// Engine that allows everything except `disallowed_ids`
    #[must_use]
    pub fn with_disallowed(vocab_size: usize, disallowed_ids: &[u32]) -> Self {
        let mut allowed = vec![true; vocab_size];
        for &id in disallowed_ids {
            allowed[id as usize] = false;
        }
        Self::from_allowed(vocab_size, allowed)
    }

    /// Replace the allowed set with exactly `allowed_ids`
    pub fn set_allowed(&mut self, allowed_ids: &[u32]) {
        self.allowed = vec![false; self.vocab_size];
        for &id in allowed_ids {
            self.allowed[id as usize] = true;
        }
    }

    /// Replace the allowed set with everything except `disallowed_ids`
    pub fn set_disallowed(&mut self, disallowed_ids: &[u32]) {
        self.allowed = vec![true; self.vocab_size];
        for &id in disallowed_ids {
            self.allowed[id as usize] = false;
        }
    }

    /// Make the next accepted token terminate the grammar
    pub fn finish_after_next_accept(&mut self) {
        self.finish_on_accept = true;
    }
}

impl GrammarEngine for MockGrammarEngine {
    fn compute_allowed_token_ids(&mut self) -> AcceptResult {
        if self.finished {
            AcceptResult::Finished
        } else {
            AcceptResult::Ongoing
        }
    }

    fn allowed_set_fingerprint(&self) -> Fingerprint {
        // Content-addressed: pack the allowed set into bytes, the way a
        // real engine exposes its allowed-set bitset.
        let mut bytes = vec![0u8; (self.vocab_size + 7) / 8];
        for (id, &allowed) in self.allowed.iter().enumerate() {
            if allowed {
                bytes[id / 8] |= 1 << (id % 8);
            }
        }
        Fingerprint::from_bytes(&bytes)
    }

    fn allowed_count(&self) -> usize {
        self.allowed.iter().filter(|&&a| a).count()
    }

    fn disallowed_count(&self) -> usize {
        self.vocab_size - self.allowed_count()
    }

    fn write_allowed_ids(&self, buf: &mut [i64]) {
        assert_eq!(buf.len(), self.allowed_count(), "allowed buffer size");
        let mut next = 0;
        for (id, &allowed) in self.allowed.iter().enumerate() {
            if allowed {
                buf[next] = id as i64;
                next += 1;
            }
        }
    }

    fn write_disallowed_ids(&self, buf: &mut [i64]) {
        assert_eq!(buf.len(), self.disallowed_count(), "disallowed buffer size");
        let mut next = 0;
        for (id, &allowed) in self.allowed.iter().enumerate() {
            if !allowed {
                buf[next] = id as i64;
                next += 1;
            }
        }
    }

    fn fill_bitmask(&self, words: &mut [u32]) {
        assert_eq!(words.len(), bitmask_words(self.vocab_size), "bitmask size");
        for (id, &allowed) in self.allowed.iter().enumerate() {
            if !allowed {
                words[id / 32] |= 1 << (id % 32);
            }
        }
    }

    fn try_accept_token(&mut self, token_id: u32) -> AcceptResult {
        if self.finished {
            return AcceptResult::Finished;
        }
        let permitted = (token_id as usize) < self.vocab_size && self.allowed[token_id as usize];
        if !permitted {
            return AcceptResult::Rejected;
        }
        if self.finish_on_accept {
            self.finished = true;
            AcceptResult::Finished
        } else {
            AcceptResult::Ongoing
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn reset(&mut self) {
        self.allowed = self.initial.clone();
        self.finished = false;
        self.finish_on_accept = false;
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}
