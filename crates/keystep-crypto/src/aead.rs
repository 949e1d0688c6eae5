//! Authenticated encryption using `XChaCha20-Poly1305`
//!
//! Sealed output is self-contained: `nonce (24) || ciphertext || tag (16)`.
//! Nonces are caller-provided so that every operation stays deterministic
//! under a seeded environment.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Size of an authenticated encryption key
pub const KEY_SIZE: usize = 32;

/// Size of the `XChaCha20` nonce
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Bytes added by [`seal`] on top of the plaintext length
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// A symmetric key for a single message or payload.
///
/// Key material is zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthenticatedEncryptionKey {
    key: [u8; KEY_SIZE],
}

impl AuthenticatedEncryptionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for AuthenticatedEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthenticatedEncryptionKey(..)")
    }
}

impl Drop for AuthenticatedEncryptionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Encrypt `plaintext` under `key`.
pub fn seal(key: &AuthenticatedEncryptionKey, plaintext: &[u8], nonce: [u8; NONCE_SIZE]) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), plaintext) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    sealed
}

/// Decrypt output of [`seal`].
///
/// # Errors
///
/// - `DecryptionFailed`: input shorter than the overhead, wrong key or tamper
pub fn open(key: &AuthenticatedEncryptionKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CryptoError::DecryptionFailed {
            reason: format!("sealed payload too short: {} bytes", sealed.len()),
        });
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher.decrypt(XNonce::from_slice(nonce), ciphertext).map_err(|_| {
        CryptoError::DecryptionFailed { reason: "authentication failed".to_string() }
    })
}
