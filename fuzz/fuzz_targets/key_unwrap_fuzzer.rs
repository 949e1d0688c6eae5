//! Fuzz target for unwrapping keys
//!
//! A fixed recipient receives arbitrary wrapped blobs, including genuine
//! wraps with flipped bytes. Tampered input must fail to unwrap; an untouched
//! wrap must return the original key.

#![no_main]

use arbitrary::Arbitrary;
use keystep_crypto::{
    AuthenticatedEncryptionKey, EncryptionKeyPair,
    wrap::{KEYPAIR_RANDOMNESS_SIZE, WRAP_RANDOMNESS_SIZE, unwrap_key, wrap_key},
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    raw: Vec<u8>,
    key: [u8; 32],
    randomness: Vec<u8>,
    flip: Option<(u16, u8)>,
}

fuzz_target!(|input: Input| {
    let keys = EncryptionKeyPair::generate(&[7u8; KEYPAIR_RANDOMNESS_SIZE]);

    let _ = unwrap_key(keys.private_key(), &input.raw);

    let mut randomness = [0u8; WRAP_RANDOMNESS_SIZE];
    for (slot, byte) in randomness.iter_mut().zip(input.randomness.iter().cycle()) {
        *slot = *byte;
    }
    let key = AuthenticatedEncryptionKey::from_bytes(input.key);
    let mut wrapped = wrap_key(&keys.public_key(), &key, &randomness).unwrap();

    match input.flip {
        Some((index, mask)) if mask != 0 => {
            let index = usize::from(index) % wrapped.len();
            wrapped[index] ^= mask;
            assert!(unwrap_key(keys.private_key(), &wrapped).is_err());
        },
        _ => {
            let unwrapped = unwrap_key(keys.private_key(), &wrapped).unwrap();
            assert_eq!(unwrapped.as_bytes(), key.as_bytes());
        },
    }
});
