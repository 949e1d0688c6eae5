//! Environment abstraction for deterministic testing.
//!
//! Protocol steps never touch the OS directly: every random value (instance
//! uids, message keys, nonces, ephemeral scalars) is drawn from the
//! [`Environment`]. A seeded simulation environment therefore replays a whole
//! multi-device run byte for byte.

use keystep_proto::{UID_LEN, Uid};

/// Source of randomness for the engine.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Given the same seed, a simulation implementation produces the same
///   sequence of bytes
pub trait Environment: Clone + Send + Sync + 'static {
    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// A fixed-size array of random bytes.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }

    /// A fresh random [`Uid`].
    fn random_uid(&self) -> Uid {
        Uid::from_bytes(self.random_array::<UID_LEN>())
    }

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        u64::from_be_bytes(self.random_array::<8>())
    }
}
