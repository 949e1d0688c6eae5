//! Symmetric key ratchet for confirmed device-to-device channels
//!
//! A channel seed is split into two directional chains. The sending side
//! steps its chain once per wrapped message key; the receiving side steps
//! forward to whatever counter arrives and keeps the skipped keys in a
//! bounded window so that reordered messages still unwrap.
//!
//! # Security Properties
//!
//! - Forward Secrecy: chain keys are overwritten when advancing
//! - Key Uniqueness: each counter yields a distinct key, handed out once
//! - Determinism: the same seed always produces the same key sequence

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{aead::AuthenticatedEncryptionKey, error::CryptoError, kdf};

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"keystep chain";

/// Label for deriving a wrapping key from a chain key
const KEY_LABEL: &[u8] = b"keystep key";

/// Label for the identifier a receiver uses to find its chain
const CHAIN_ID_LABEL: &[u8] = b"keystep chain id";

/// Maximum number of skipped keys retained for out-of-order messages
pub const MAX_SKIP: u32 = 256;

/// Size of a chain identifier
pub const CHAIN_ID_SIZE: usize = 16;

/// Which direction of a channel a chain serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainDirection {
    /// Keys flow from the lower endpoint to the higher one
    LowToHigh,
    /// Keys flow from the higher endpoint to the lower one
    HighToLow,
}

impl ChainDirection {
    fn label(self) -> &'static [u8] {
        match self {
            Self::LowToHigh => b"keystep low to high",
            Self::HighToLow => b"keystep high to low",
        }
    }
}

/// Derive the initial chain key for one direction of a channel.
pub fn chain_seed(channel_seed: &[u8; 32], direction: ChainDirection) -> [u8; 32] {
    kdf::derive_key(channel_seed, direction.label())
}

/// Forward-secure key chain.
pub struct KeyRatchet {
    /// Current chain key
    chain_key: [u8; 32],
    /// Counter of the next key this chain will produce
    counter: u32,
    /// Public identifier derived from the initial chain key
    chain_id: [u8; CHAIN_ID_SIZE],
    /// Keys stepped over while catching up, by counter
    skipped: BTreeMap<u32, AuthenticatedEncryptionKey>,
}

impl KeyRatchet {
    /// Start a chain from its initial key.
    pub fn new(seed: &[u8; 32]) -> Self {
        let id_material = kdf::derive_key(seed, CHAIN_ID_LABEL);
        let mut chain_id = [0u8; CHAIN_ID_SIZE];
        chain_id.copy_from_slice(&id_material[..CHAIN_ID_SIZE]);
        Self { chain_key: *seed, counter: 0, chain_id, skipped: BTreeMap::new() }
    }

    /// Identifier of this chain, safe to send in the clear.
    pub fn chain_id(&self) -> [u8; CHAIN_ID_SIZE] {
        self.chain_id
    }

    /// Counter of the next key [`Self::next_key`] returns.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Produce the next key in sequence.
    pub fn next_key(&mut self) -> Result<(u32, AuthenticatedEncryptionKey), CryptoError> {
        if self.counter == u32::MAX {
            return Err(CryptoError::CounterOverflow { current: self.counter });
        }

        let key = AuthenticatedEncryptionKey::from_bytes(self.mac(KEY_LABEL));
        let next_chain_key = self.mac(CHAIN_LABEL);
        self.chain_key.zeroize();
        self.chain_key = next_chain_key;

        let counter = self.counter;
        self.counter += 1;
        Ok((counter, key))
    }

    /// Take the key for `counter`, stepping forward if needed.
    ///
    /// Each key is returned at most once.
    pub fn key_at(&mut self, counter: u32) -> Result<AuthenticatedEncryptionKey, CryptoError> {
        if counter < self.counter {
            return self
                .skipped
                .remove(&counter)
                .ok_or(CryptoError::RatchetKeyUnavailable { counter });
        }

        if counter - self.counter > MAX_SKIP {
            return Err(CryptoError::RatchetWindowExceeded {
                current: self.counter,
                requested: counter,
            });
        }

        while self.counter < counter {
            let (skipped_counter, key) = self.next_key()?;
            self.skipped.insert(skipped_counter, key);
        }
        while self.skipped.len() > MAX_SKIP as usize {
            self.skipped.pop_first();
        }

        let (_, key) = self.next_key()?;
        Ok(key)
    }

    fn mac(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.chain_key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut out = [0u8; 32];
        out.copy_from_slice(&result);
        out
    }
}

impl Drop for KeyRatchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn test_seed() -> [u8; 32] {
        let mut seed = [0u8; 32];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = i as u8;
        }
        seed
    }

    #[test]
    fn sender_and_receiver_agree() {
        let mut sender = KeyRatchet::new(&test_seed());
        let mut receiver = KeyRatchet::new(&test_seed());
        assert_eq!(sender.chain_id(), receiver.chain_id());

        for _ in 0..5 {
            let (counter, key) = sender.next_key().unwrap();
            assert_eq!(receiver.key_at(counter).unwrap(), key);
        }
    }

    #[test]
    fn out_of_order_keys_come_from_window() {
        let mut sender = KeyRatchet::new(&test_seed());
        let mut receiver = KeyRatchet::new(&test_seed());

        let keys: Vec<_> = (0..4).map(|_| sender.next_key().unwrap()).collect();
        assert_eq!(receiver.key_at(3).unwrap(), keys[3].1);
        assert_eq!(receiver.key_at(1).unwrap(), keys[1].1);
        assert_eq!(receiver.key_at(0).unwrap(), keys[0].1);
    }

    #[test]
    fn keys_are_handed_out_once() {
        let mut receiver = KeyRatchet::new(&test_seed());
        receiver.key_at(2).unwrap();
        assert!(matches!(receiver.key_at(2), Err(CryptoError::RatchetKeyUnavailable { counter: 2 })));
    }

    #[test]
    fn window_is_bounded() {
        let mut receiver = KeyRatchet::new(&test_seed());
        assert!(matches!(
            receiver.key_at(MAX_SKIP + 1),
            Err(CryptoError::RatchetWindowExceeded { current: 0, .. })
        ));
        assert_eq!(receiver.counter(), 0);
    }

    #[test]
    fn directions_use_distinct_chains() {
        let seed = test_seed();
        let low = KeyRatchet::new(&chain_seed(&seed, ChainDirection::LowToHigh));
        let high = KeyRatchet::new(&chain_seed(&seed, ChainDirection::HighToLow));
        assert_ne!(low.chain_id(), high.chain_id());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_keys_are_unique(count in 2usize..64) {
            let mut ratchet = KeyRatchet::new(&test_seed());
            let mut seen = std::collections::HashSet::new();
            for _ in 0..count {
                let (_, key) = ratchet.next_key().unwrap();
                prop_assert!(seen.insert(*key.as_bytes()));
            }
        }
    }
}
