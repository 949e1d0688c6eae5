//! Keystep Cryptographic Primitives
//!
//! Building blocks for the keystep protocol engine. Pure functions with
//! deterministic outputs: callers provide random bytes, which keeps every
//! higher layer reproducible under a seeded environment.
//!
//! # Layers
//!
//! ```text
//! BigInt (limb arithmetic, powm, invert, sqrtm)
//!        │
//!        ▼
//! Edwards25519 (point add, scalar mul, compression)
//!        │
//!        ▼
//! Key wrapping (ECIES: ephemeral DH → HKDF → AEAD)
//!        │
//!        ▼
//! Message keys → XChaCha20-Poly1305 payloads
//! ```
//!
//! Confirmed device channels replace the public-key layer with a
//! [`KeyRatchet`] seeded from material exchanged during channel creation.
//!
//! # Security
//!
//! - Message keys are used once and zeroized on drop
//! - Ratchet chain keys are overwritten on every step
//! - Wrapped keys bind the ephemeral point into the wrapping key
//! - Big-integer arithmetic is not constant time; it is used for key
//!   agreement in a simulation-first engine, not hardened deployments

#![forbid(unsafe_code)]

pub mod aead;
pub mod bigint;
pub mod edwards;
pub mod error;
pub mod kdf;
pub mod ratchet;
pub mod wrap;

pub use aead::{AuthenticatedEncryptionKey, SEAL_OVERHEAD};
pub use bigint::{BigInt, BigIntError};
pub use edwards::{EdwardsPoint, Scalar};
pub use error::CryptoError;
pub use ratchet::{ChainDirection, KeyRatchet};
pub use wrap::{
    EncryptionKeyPair, PrivateKeyForEncryption, PublicKeyForEncryption, unwrap_key, wrap_key,
};
