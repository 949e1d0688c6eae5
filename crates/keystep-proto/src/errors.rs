//! Protocol encoding errors

use thiserror::Error;

/// Result type for protocol encoding operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors from encoding and decoding protocol values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// CBOR serialization failed
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),

    /// An encoded identity is truncated or has trailing bytes
    #[error("malformed identity encoding: {0}")]
    MalformedIdentity(&'static str),

    /// Unknown protocol identifier on the wire
    #[error("unknown protocol id: {0}")]
    UnknownProtocol(u16),
}
