//! Key derivation using HKDF-SHA256

use hkdf::Hkdf;
use sha2::Sha256;

use crate::aead::{AuthenticatedEncryptionKey, KEY_SIZE};

/// Label for the key that seals a wrapped message key
const WRAP_LABEL: &[u8] = b"keystepKeyWrapV1";

/// Label for the seed of a newly confirmed oblivious channel
const CHANNEL_SEED_LABEL: &[u8] = b"keystepChannelSeedV1";

/// Expand `ikm` into 32 bytes under `label`.
pub fn derive_key(ikm: &[u8], label: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);

    let mut out = [0u8; 32];
    let Ok(()) = hkdf.expand(label, &mut out) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    out
}

/// Derive the AEAD key protecting a wrapped message key.
///
/// Binds both the Diffie-Hellman output and the ephemeral public point so
/// that a wrapped key cannot be replayed under another ephemeral.
pub fn derive_wrapping_key(
    shared_point: &[u8; 32],
    ephemeral_point: &[u8; 32],
) -> AuthenticatedEncryptionKey {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(shared_point);
    ikm[32..].copy_from_slice(ephemeral_point);

    let key: [u8; KEY_SIZE] = derive_key(&ikm, WRAP_LABEL);
    AuthenticatedEncryptionKey::from_bytes(key)
}

/// Combine both halves exchanged during channel creation into one seed.
///
/// Order matters: `initiator_half` comes from the device that sent the
/// first ping.
pub fn derive_channel_seed(initiator_half: &[u8; 32], responder_half: &[u8; 32]) -> [u8; 32] {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(initiator_half);
    ikm[32..].copy_from_slice(responder_half);
    derive_key(&ikm, CHANNEL_SEED_LABEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic() {
        let a = derive_key(b"input keying material", b"label");
        let b = derive_key(b"input keying material", b"label");
        assert_eq!(a, b, "same inputs must produce same output");
    }

    #[test]
    fn labels_separate_outputs() {
        assert_ne!(derive_key(b"ikm", b"one"), derive_key(b"ikm", b"two"));
    }

    #[test]
    fn channel_seed_depends_on_order() {
        let k1 = [1u8; 32];
        let k2 = [2u8; 32];
        assert_ne!(derive_channel_seed(&k1, &k2), derive_channel_seed(&k2, &k1));
    }

    #[test]
    fn wrapping_key_binds_ephemeral() {
        let shared = [9u8; 32];
        let a = derive_wrapping_key(&shared, &[1u8; 32]);
        let b = derive_wrapping_key(&shared, &[2u8; 32]);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
