//! Environment backed by the OS RNG.

use keystep_core::Environment;

/// Production environment drawing from getrandom.
///
/// Not reproducible. Key generation uses it; simulations use a seeded
/// `SimEnv` instead.
///
/// # Panics
///
/// Panics if the OS RNG fails. Keys drawn without a working RNG would be
/// predictable.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_differ() {
        let env = SystemEnv;
        let first: [u8; 32] = env.random_array();
        let second: [u8; 32] = env.random_array();
        assert_ne!(first, second);
    }

    #[test]
    fn fills_whole_buffer() {
        let mut bytes = [0u8; 64];
        SystemEnv.random_bytes(&mut bytes);
        assert!(bytes.iter().filter(|&&b| b != 0).count() > 32);
    }
}
