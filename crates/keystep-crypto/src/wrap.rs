//! Public-key wrapping of message keys (ECIES over Edwards25519).
//!
//! Wrapping a 32-byte [`AuthenticatedEncryptionKey`] to a public key `P`:
//!
//! ```text
//! r  <- random scalar
//! R  =  r * B
//! S  =  r * P
//! K  =  HKDF(S || R)
//! wrapped = R (32) || seal(K, key) (24 + 32 + 16)
//! ```
//!
//! Unwrapping recomputes `S = sk * R`. Callers supply all randomness.

use zeroize::Zeroize;

use crate::{
    aead::{self, AuthenticatedEncryptionKey, KEY_SIZE, NONCE_SIZE, SEAL_OVERHEAD},
    edwards::{EdwardsPoint, POINT_SIZE, SCALAR_SIZE, Scalar},
    error::CryptoError,
    kdf,
};

/// Random bytes consumed by [`wrap_key`]: 64 for the ephemeral scalar, the
/// rest for the AEAD nonce
pub const WRAP_RANDOMNESS_SIZE: usize = 64 + NONCE_SIZE;

/// Random bytes consumed by [`EncryptionKeyPair::generate`]
pub const KEYPAIR_RANDOMNESS_SIZE: usize = 64;

/// Length of every wrapped key
pub const WRAPPED_KEY_SIZE: usize = POINT_SIZE + KEY_SIZE + SEAL_OVERHEAD;

/// A compressed Edwards25519 point used as an encryption public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PublicKeyForEncryption([u8; POINT_SIZE]);

impl PublicKeyForEncryption {
    /// Validate a compressed point.
    ///
    /// # Errors
    ///
    /// - `InvalidPoint` if the bytes do not decode or the point has small
    ///   order (the identity included), since wrapping to such a key would
    ///   leak the shared secret
    pub fn from_bytes(bytes: [u8; POINT_SIZE]) -> Result<Self, CryptoError> {
        let point = EdwardsPoint::decompress(&bytes)?;
        if point.is_small_order() {
            return Err(CryptoError::InvalidPoint);
        }
        Ok(Self(bytes))
    }

    /// Compressed encoding.
    pub fn to_bytes(&self) -> [u8; POINT_SIZE] {
        self.0
    }

    fn point(&self) -> Result<EdwardsPoint, CryptoError> {
        EdwardsPoint::decompress(&self.0)
    }
}

/// An encryption private key. Zeroized on drop.
#[derive(Clone)]
pub struct PrivateKeyForEncryption([u8; SCALAR_SIZE]);

impl PrivateKeyForEncryption {
    /// Validate a canonical scalar encoding.
    pub fn from_bytes(bytes: [u8; SCALAR_SIZE]) -> Result<Self, CryptoError> {
        Scalar::from_canonical_bytes(&bytes)?;
        Ok(Self(bytes))
    }

    /// Canonical scalar encoding.
    pub fn to_bytes(&self) -> [u8; SCALAR_SIZE] {
        self.0
    }

    /// The matching public key.
    pub fn public_key(&self) -> Result<PublicKeyForEncryption, CryptoError> {
        let scalar = Scalar::from_canonical_bytes(&self.0)?;
        Ok(PublicKeyForEncryption(EdwardsPoint::base().mul(&scalar).compress()))
    }
}

impl std::fmt::Debug for PrivateKeyForEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKeyForEncryption(..)")
    }
}

impl Drop for PrivateKeyForEncryption {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// A private key with its public key.
#[derive(Clone, Debug)]
pub struct EncryptionKeyPair {
    private: PrivateKeyForEncryption,
    public: PublicKeyForEncryption,
}

impl EncryptionKeyPair {
    /// Generate a key pair from uniform random bytes.
    pub fn generate(randomness: &[u8; KEYPAIR_RANDOMNESS_SIZE]) -> Self {
        let scalar = Scalar::from_random_nonzero(randomness);
        let public = PublicKeyForEncryption(EdwardsPoint::base().mul(&scalar).compress());
        Self { private: PrivateKeyForEncryption(scalar.to_bytes()), public }
    }

    /// Private half.
    pub fn private_key(&self) -> &PrivateKeyForEncryption {
        &self.private
    }

    /// Public half.
    pub fn public_key(&self) -> PublicKeyForEncryption {
        self.public
    }
}

/// Wrap `key` so that only the holder of the private key for `recipient`
/// can recover it.
pub fn wrap_key(
    recipient: &PublicKeyForEncryption,
    key: &AuthenticatedEncryptionKey,
    randomness: &[u8; WRAP_RANDOMNESS_SIZE],
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = Scalar::from_random_nonzero(&randomness[..64]);
    let ephemeral_point = EdwardsPoint::base().mul(&ephemeral).compress();
    let shared = recipient.point()?.mul(&ephemeral).compress();

    let wrapping_key = kdf::derive_wrapping_key(&shared, &ephemeral_point);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&randomness[64..]);
    let sealed = aead::seal(&wrapping_key, key.as_bytes(), nonce);

    let mut wrapped = Vec::with_capacity(WRAPPED_KEY_SIZE);
    wrapped.extend_from_slice(&ephemeral_point);
    wrapped.extend_from_slice(&sealed);
    Ok(wrapped)
}

/// Recover a key produced by [`wrap_key`].
///
/// # Errors
///
/// - `MalformedWrappedKey` if the input has the wrong length
/// - `InvalidPoint` if the ephemeral point does not decode
/// - `DecryptionFailed` if the key was wrapped for someone else or tampered
pub fn unwrap_key(
    private_key: &PrivateKeyForEncryption,
    wrapped: &[u8],
) -> Result<AuthenticatedEncryptionKey, CryptoError> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(CryptoError::MalformedWrappedKey {
            expected: WRAPPED_KEY_SIZE,
            actual: wrapped.len(),
        });
    }

    let (point_bytes, sealed) = wrapped.split_at(POINT_SIZE);
    let mut ephemeral_point = [0u8; POINT_SIZE];
    ephemeral_point.copy_from_slice(point_bytes);

    let scalar = Scalar::from_canonical_bytes(&private_key.0)?;
    let shared = EdwardsPoint::decompress(&ephemeral_point)?.mul(&scalar).compress();

    let wrapping_key = kdf::derive_wrapping_key(&shared, &ephemeral_point);
    let mut plaintext = aead::open(&wrapping_key, sealed)?;
    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        return Err(CryptoError::DecryptionFailed {
            reason: "unwrapped key has wrong length".to_string(),
        });
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(AuthenticatedEncryptionKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(seed: u8) -> EncryptionKeyPair {
        EncryptionKeyPair::generate(&[seed; KEYPAIR_RANDOMNESS_SIZE])
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let recipient = keypair(1);
        let key = AuthenticatedEncryptionKey::from_bytes([0x42; KEY_SIZE]);

        let wrapped = wrap_key(&recipient.public_key(), &key, &[7; WRAP_RANDOMNESS_SIZE]).unwrap();
        assert_eq!(wrapped.len(), WRAPPED_KEY_SIZE);

        let unwrapped = unwrap_key(recipient.private_key(), &wrapped).unwrap();
        assert_eq!(unwrapped, key);
    }

    #[test]
    fn other_recipient_cannot_unwrap() {
        let recipient = keypair(1);
        let eavesdropper = keypair(2);
        let key = AuthenticatedEncryptionKey::from_bytes([0x42; KEY_SIZE]);

        let wrapped = wrap_key(&recipient.public_key(), &key, &[7; WRAP_RANDOMNESS_SIZE]).unwrap();
        assert!(matches!(
            unwrap_key(eavesdropper.private_key(), &wrapped),
            Err(CryptoError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn truncated_wrapped_key_is_malformed() {
        let recipient = keypair(3);
        assert!(matches!(
            unwrap_key(recipient.private_key(), &[0u8; 10]),
            Err(CryptoError::MalformedWrappedKey { expected: WRAPPED_KEY_SIZE, actual: 10 })
        ));
    }

    #[test]
    fn private_key_derives_public_key() {
        let pair = keypair(4);
        let restored = PrivateKeyForEncryption::from_bytes(pair.private_key().to_bytes()).unwrap();
        assert_eq!(restored.public_key().unwrap(), pair.public_key());
    }

    #[test]
    fn identity_is_not_a_public_key() {
        let identity = EdwardsPoint::identity().compress();
        assert!(matches!(
            PublicKeyForEncryption::from_bytes(identity),
            Err(CryptoError::InvalidPoint)
        ));
    }

    #[test]
    fn small_order_points_are_not_public_keys() {
        // (sqrt(-1), 0) with either sign has order 4
        let mut order_four = [0u8; POINT_SIZE];
        assert!(matches!(
            PublicKeyForEncryption::from_bytes(order_four),
            Err(CryptoError::InvalidPoint)
        ));
        order_four[0] |= 0x80;
        assert!(matches!(
            PublicKeyForEncryption::from_bytes(order_four),
            Err(CryptoError::InvalidPoint)
        ));

        // (0, -1) has order 2; y = p - 1 = 2^255 - 20
        let mut order_two = [0xFF; POINT_SIZE];
        order_two[0] = 0x7F;
        order_two[POINT_SIZE - 1] = 0xEC;
        assert!(matches!(
            PublicKeyForEncryption::from_bytes(order_two),
            Err(CryptoError::InvalidPoint)
        ));

        let public = keypair(5).public_key();
        assert_eq!(PublicKeyForEncryption::from_bytes(public.to_bytes()).unwrap(), public);
    }
}
