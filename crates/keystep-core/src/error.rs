//! Error types for the keystep engine.
//!
//! One enum per layer. Expected protocol divergence (stale versions, steps
//! that do not match, channel expectations that fail) is not an error here:
//! the executor reports it as a [`crate::ProcessOutcome`]. What remains is
//! collaborator faults, corrupt encodings and storage failures.

use keystep_crypto::CryptoError;
use keystep_proto::{CryptoIdentity, ProtocolError};
use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised by the identity collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The identity is not owned on this device
    #[error("unknown owned identity: {0}")]
    UnknownOwnedIdentity(CryptoIdentity),

    /// The identity is not a contact of the owned identity
    #[error("unknown contact: {0}")]
    UnknownContact(CryptoIdentity),

    /// The identity store failed
    #[error("identity store failure: {0}")]
    Store(String),
}

/// Errors raised while selecting channels, wrapping or unwrapping keys.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Posting on behalf of an identity this device does not own
    #[error("identity is not owned by this device: {0}")]
    UnknownOwnedIdentity(CryptoIdentity),

    /// The payload may not travel on the requested channel
    #[error("{payload} payload cannot be posted on {channel} channel")]
    IncompatiblePayload {
        /// Payload kind
        payload: &'static str,
        /// Requested channel kind
        channel: &'static str,
    },

    /// A collaborator required by the channel is not configured
    #[error("missing collaborator: {0}")]
    MissingDelegate(&'static str),

    /// Every candidate channel refused to wrap the message key
    #[error("message key could not be wrapped for any channel")]
    CouldNotWrapForAnyChannel,

    /// Plaintext could not be encoded
    #[error("encoding error: {0}")]
    Encoding(#[from] ProtocolError),

    /// Identity lookup failed while selecting channels
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

impl ChannelError {
    /// True for configuration mistakes that no retry will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingDelegate(_) | Self::IncompatiblePayload { .. })
    }
}

/// Errors that abort a protocol step.
///
/// An aborted step leaves the previously committed state untouched. The
/// triggering message is consumed so it cannot abort the instance again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// A state or message failed to encode or decode
    #[error("encoding error: {0}")]
    Encoding(#[from] ProtocolError),

    /// The identity collaborator failed
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Posting failed for a reason other than an unreachable recipient
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A cryptographic precondition was violated
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The step table paired a step with a state or message it cannot handle
    #[error("step {step} cannot run on the given state and message")]
    StepTableMismatch {
        /// Step that was selected
        step: &'static str,
    },
}

impl StepError {
    /// True if the abort indicates a programming error rather than bad input.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::StepTableMismatch { .. } => true,
            Self::Channel(err) => err.is_fatal(),
            Self::Crypto(err) => err.is_fatal(),
            Self::Encoding(_) | Self::Identity(_) => false,
        }
    }
}

/// Errors surfaced by the executor and runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Persistence failed; nothing of the step was applied
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A received message or stored state failed to encode or decode
    #[error("encoding error: {0}")]
    Encoding(#[from] ProtocolError),

    /// Opening an inbound envelope failed on configuration
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The identity collaborator failed before a step could run
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// The runtime worker for an identity is gone
    #[error("runtime is shut down")]
    RuntimeShutdown,
}

impl EngineError {
    /// True if the same call may succeed when retried.
    ///
    /// Storage I/O failures leave the message pending, so a retry (or
    /// [`crate::ProtocolExecutor::replay_pending`]) picks it up again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(StorageError::Io(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_io_is_transient() {
        assert!(EngineError::Storage(StorageError::Io("disk".into())).is_transient());
        assert!(!EngineError::Storage(StorageError::Serialization("bad".into())).is_transient());
        assert!(!EngineError::RuntimeShutdown.is_transient());
    }

    #[test]
    fn configuration_errors_are_fatal() {
        assert!(StepError::Channel(ChannelError::MissingDelegate("oblivious")).is_fatal());
        assert!(!StepError::Channel(ChannelError::CouldNotWrapForAnyChannel).is_fatal());
        assert!(StepError::StepTableMismatch { step: "SendPing" }.is_fatal());
        assert!(!StepError::Crypto(CryptoError::InvalidPoint).is_fatal());
    }
}
