//! Error types for masking operations
//!
//! All buffer and shape errors are detected before any mutation occurs,
//! so a rejected call never leaves a logits buffer partially masked.
//! Grammar-side token rejection is NOT an error: it is reported as
//! [`crate::grammar::AcceptResult::Rejected`].

use thiserror::Error;

/// Result type alias for masking operations
pub type Result<T> = std::result::Result<T, BozalError>;

/// Errors that can occur while masking logits
#[derive(Debug, Error)]
pub enum BozalError {
    /// No registered converter recognizes the logits handle's concrete type
    #[error("unsupported logits handle type ({type_id})")]
    UnsupportedType {
        /// Debug rendering of the handle's `TypeId`
        type_id: String,
    },

    /// Shape outside the supported `(n,)` / `(1, n)` / `(rows, n)` forms
    #[error("invalid logits shape: {reason}")]
    InvalidShape {
        /// Human-readable description of the violation
        reason: String,
    },

    /// Allocator returned a pointer violating the alignment contract.
    ///
    /// Float buffers must be 4-byte aligned and integer id buffers 8-byte
    /// aligned. This indicates a broken allocator, not user error.
    #[error("buffer at {addr:#x} is not aligned to {required} bytes")]
    Misaligned {
        /// Address that failed the check
        addr: usize,
        /// Required alignment in bytes
        required: usize,
    },

    /// Logits buffer shorter than the vocabulary the engine expects
    #[error("logits length {actual} is shorter than the expected vocabulary size {expected}")]
    InvalidLength {
        /// Vocabulary size the engine expects
        expected: usize,
        /// Length actually provided
        actual: usize,
    },

    /// Device backend failure (context, compilation, transfer, or launch)
    #[error("GPU error: {reason}")]
    Gpu {
        /// Underlying driver/compiler message
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_length() {
        let err = BozalError::InvalidLength {
            expected: 32000,
            actual: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("32000"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_error_display_misaligned() {
        let err = BozalError::Misaligned {
            addr: 0x1003,
            required: 4,
        };
        assert!(err.to_string().contains("0x1003"));
    }

    #[test]
    fn test_result_alias() {
        fn ok() -> Result<u32> {
            Ok(7)
        }
        assert_eq!(ok().unwrap(), 7);
    }
}
