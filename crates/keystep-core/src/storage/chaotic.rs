//! Chaotic storage wrapper for fault injection testing
//!
//! Fails reads and commits at a configured rate. Chaos tests use it to check
//! that a failed commit leaves no trace of the step and that the triggering
//! message is still pending afterwards.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use keystep_proto::{CryptoIdentity, Uid};

use super::{InstanceKey, Storage, StorageBatch, StorageError, StoredInstance};

/// Storage wrapper that randomly injects I/O failures
///
/// Delegates to an underlying storage implementation. A failed call never
/// reaches the inner storage, so a failed commit writes nothing.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Failures injected so far
    injected: Arc<AtomicUsize>,
}

/// Linear congruential generator, reproducible from its seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner` with the default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng { state: seed })),
            injected: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::Relaxed)
    }

    fn maybe_fail(&self, operation: &'static str) -> Result<(), StorageError> {
        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if roll < self.failure_rate {
            self.injected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(operation, "injecting storage failure");
            return Err(StorageError::Io(format!("chaotic failure injection in {operation}")));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn load_instance(&self, key: &InstanceKey) -> Result<Option<Vec<u8>>, StorageError> {
        self.maybe_fail("load_instance")?;
        self.inner.load_instance(key)
    }

    fn list_instances(&self, owned: &CryptoIdentity) -> Result<Vec<StoredInstance>, StorageError> {
        self.maybe_fail("list_instances")?;
        self.inner.list_instances(owned)
    }

    fn is_finished(&self, key: &InstanceKey) -> Result<bool, StorageError> {
        self.maybe_fail("is_finished")?;
        self.inner.is_finished(key)
    }

    fn load_pending(&self, owned: &CryptoIdentity) -> Result<Vec<(Uid, Vec<u8>)>, StorageError> {
        self.maybe_fail("load_pending")?;
        self.inner.load_pending(owned)
    }

    fn commit(&self, batch: &StorageBatch) -> Result<(), StorageError> {
        self.maybe_fail("commit")?;
        self.inner.commit(batch)
    }

    fn delete_identity(&self, owned: &CryptoIdentity) -> Result<usize, StorageError> {
        self.maybe_fail("delete_identity")?;
        self.inner.delete_identity(owned)
    }
}

#[cfg(test)]
mod tests {
    use keystep_proto::ProtocolId;

    use super::*;
    use crate::storage::MemoryStorage;

    fn key() -> InstanceKey {
        InstanceKey {
            owned_identity: CryptoIdentity::new("https://server.example", [1; 32]),
            protocol_id: ProtocolId::DeviceDiscovery,
            instance_uid: Uid::from_bytes([1; 32]),
        }
    }

    #[test]
    fn zero_rate_never_fails() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0);
        for _ in 0..100 {
            assert!(storage.is_finished(&key()).is_ok());
        }
        assert_eq!(storage.injected_failures(), 0);
    }

    #[test]
    fn full_rate_never_reaches_inner() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 1.0);
        let mut batch = StorageBatch::new();
        batch.put_instance(key(), vec![1]);

        assert!(matches!(storage.commit(&batch), Err(StorageError::Io(_))));
        assert_eq!(storage.inner().load_instance(&key()).unwrap(), None);
        assert_eq!(storage.injected_failures(), 1);
    }

    #[test]
    fn same_seed_same_failures() {
        let run = |seed| {
            let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, seed);
            (0..64).map(|_| storage.is_finished(&key()).is_err()).collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
        assert!(run(7).contains(&true));
    }
}
