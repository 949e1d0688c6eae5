//! Error types for key wrapping and channel ratchet operations

use thiserror::Error;

use crate::bigint::BigIntError;

/// Errors from cryptographic operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Decryption failed (authentication tag mismatch or truncated input)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// A compressed point does not decode to a curve point
    #[error("invalid curve point")]
    InvalidPoint,

    /// A private key scalar is zero or not reduced
    #[error("invalid private key")]
    InvalidPrivateKey,

    /// Wrapped key material has the wrong length
    #[error("malformed wrapped key: expected {expected} bytes, got {actual}")]
    MalformedWrappedKey {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Requested ratchet counter is further ahead than the skip window
    #[error("ratchet counter {requested} is beyond window at {current}")]
    RatchetWindowExceeded {
        /// Next counter the ratchet would produce
        current: u32,
        /// Requested counter
        requested: u32,
    },

    /// Key for this counter was already consumed or dropped from the window
    #[error("ratchet key for counter {counter} is no longer available")]
    RatchetKeyUnavailable {
        /// Requested counter
        counter: u32,
    },

    /// Ratchet counter would overflow
    #[error("ratchet counter overflow at {current}")]
    CounterOverflow {
        /// Current counter when overflow was detected
        current: u32,
    },

    /// Underlying big-integer arithmetic failed
    #[error("arithmetic error: {0}")]
    BigInt(#[from] BigIntError),
}

impl CryptoError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// Fatal errors indicate local state corruption or exhaustion. Non-fatal
    /// errors are caused by a single bad input that can be dropped.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::CounterOverflow { .. } | Self::BigInt(_) => true,
            Self::DecryptionFailed { .. }
            | Self::InvalidPoint
            | Self::InvalidPrivateKey
            | Self::MalformedWrappedKey { .. }
            | Self::RatchetWindowExceeded { .. }
            | Self::RatchetKeyUnavailable { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_input_is_not_fatal() {
        assert!(!CryptoError::InvalidPoint.is_fatal());
        assert!(!CryptoError::MalformedWrappedKey { expected: 104, actual: 3 }.is_fatal());
        assert!(CryptoError::CounterOverflow { current: u32::MAX }.is_fatal());
    }
}
