use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use keystep_proto::{CryptoIdentity, Uid};

use super::{InstanceKey, Storage, StorageBatch, StorageError, StoredInstance};

/// In-memory storage implementation for testing and simulation
///
/// All state sits behind one `Arc<Mutex<>>`, so a batch is applied under a
/// single lock acquisition and is never observed half-written. A poisoned
/// lock surfaces as [`StorageError::Io`].
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    /// Encoded state of running instances
    instances: BTreeMap<InstanceKey, Vec<u8>>,

    /// Instances that reached a terminal state
    finished: BTreeSet<InstanceKey>,

    /// Unprocessed messages per owned identity, in arrival order
    pending: HashMap<CryptoIdentity, Vec<(Uid, Vec<u8>)>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryStorageInner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Io("memory storage lock poisoned".to_string()))
    }

    /// Number of running instances across all identities.
    pub fn instance_count(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.instances.len())
    }

    /// Number of unprocessed messages across all identities.
    pub fn pending_count(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.pending.values().map(Vec::len).sum())
    }
}

impl Storage for MemoryStorage {
    fn load_instance(&self, key: &InstanceKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock()?.instances.get(key).cloned())
    }

    fn list_instances(&self, owned: &CryptoIdentity) -> Result<Vec<StoredInstance>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .instances
            .iter()
            .filter(|(key, _)| key.owned_identity == *owned)
            .map(|(key, state)| StoredInstance { key: key.clone(), encoded_state: state.clone() })
            .collect())
    }

    fn is_finished(&self, key: &InstanceKey) -> Result<bool, StorageError> {
        Ok(self.lock()?.finished.contains(key))
    }

    fn load_pending(&self, owned: &CryptoIdentity) -> Result<Vec<(Uid, Vec<u8>)>, StorageError> {
        Ok(self.lock()?.pending.get(owned).cloned().unwrap_or_default())
    }

    fn commit(&self, batch: &StorageBatch) -> Result<(), StorageError> {
        let mut inner = self.lock()?;

        for write in &batch.instance_writes {
            inner.instances.insert(write.key.clone(), write.encoded_state.clone());
        }
        for key in &batch.finished {
            inner.instances.remove(key);
            inner.finished.insert(key.clone());
        }
        for message_id in &batch.pending_removals {
            if let Some(pending) = inner.pending.get_mut(&message_id.owned_identity) {
                pending.retain(|(uid, _)| *uid != message_id.uid);
            }
        }
        for (message_id, encoded) in &batch.pending_writes {
            let pending = inner.pending.entry(message_id.owned_identity.clone()).or_default();
            match pending.iter_mut().find(|(uid, _)| *uid == message_id.uid) {
                Some(existing) => existing.1.clone_from(encoded),
                None => pending.push((message_id.uid, encoded.clone())),
            }
        }
        inner.pending.retain(|_, pending| !pending.is_empty());

        Ok(())
    }

    fn delete_identity(&self, owned: &CryptoIdentity) -> Result<usize, StorageError> {
        let mut inner = self.lock()?;

        let before = inner.instances.len();
        inner.instances.retain(|key, _| key.owned_identity != *owned);
        let removed = before - inner.instances.len();

        inner.finished.retain(|key| key.owned_identity != *owned);
        inner.pending.remove(owned);

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use keystep_proto::{MessageId, ProtocolId};

    use super::*;

    fn alice() -> CryptoIdentity {
        CryptoIdentity::new("https://server.example", [1; 32])
    }

    fn bob() -> CryptoIdentity {
        CryptoIdentity::new("https://server.example", [2; 32])
    }

    fn key(owned: CryptoIdentity, byte: u8) -> InstanceKey {
        InstanceKey {
            owned_identity: owned,
            protocol_id: ProtocolId::IdentityDetailsPublication,
            instance_uid: Uid::from_bytes([byte; 32]),
        }
    }

    #[test]
    fn new_storage_is_empty() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.instance_count().unwrap(), 0);
        assert_eq!(storage.pending_count().unwrap(), 0);
        assert!(storage.load_instance(&key(alice(), 1)).unwrap().is_none());
    }

    #[test]
    fn committed_instance_is_loaded_back() {
        let storage = MemoryStorage::new();
        let mut batch = StorageBatch::new();
        batch.put_instance(key(alice(), 1), vec![1, 2, 3]);
        storage.commit(&batch).unwrap();

        assert_eq!(storage.load_instance(&key(alice(), 1)).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(storage.list_instances(&alice()).unwrap().len(), 1);
        assert!(storage.list_instances(&bob()).unwrap().is_empty());
    }

    #[test]
    fn finishing_replaces_state_with_tombstone() {
        let storage = MemoryStorage::new();
        let mut batch = StorageBatch::new();
        batch.put_instance(key(alice(), 1), vec![1]);
        storage.commit(&batch).unwrap();

        let mut batch = StorageBatch::new();
        batch.finish_instance(key(alice(), 1));
        storage.commit(&batch).unwrap();

        assert!(storage.load_instance(&key(alice(), 1)).unwrap().is_none());
        assert!(storage.is_finished(&key(alice(), 1)).unwrap());
        assert!(!storage.is_finished(&key(bob(), 1)).unwrap());
    }

    #[test]
    fn pending_messages_keep_arrival_order() {
        let storage = MemoryStorage::new();
        for byte in [5u8, 3, 9] {
            let mut batch = StorageBatch::new();
            batch.put_pending(
                MessageId { owned_identity: alice(), uid: Uid::from_bytes([byte; 32]) },
                vec![byte],
            );
            storage.commit(&batch).unwrap();
        }

        let pending = storage.load_pending(&alice()).unwrap();
        let order: Vec<u8> = pending.iter().map(|(_, encoded)| encoded[0]).collect();
        assert_eq!(order, vec![5, 3, 9]);

        let mut batch = StorageBatch::new();
        batch.remove_pending(MessageId { owned_identity: alice(), uid: Uid::from_bytes([3; 32]) });
        storage.commit(&batch).unwrap();
        assert_eq!(storage.pending_count().unwrap(), 2);
    }

    #[test]
    fn delete_identity_only_touches_that_identity() {
        let storage = MemoryStorage::new();
        let mut batch = StorageBatch::new();
        batch.put_instance(key(alice(), 1), vec![1]);
        batch.put_instance(key(alice(), 2), vec![2]);
        batch.finish_instance(key(alice(), 3));
        batch.put_instance(key(bob(), 1), vec![1]);
        batch.put_pending(MessageId { owned_identity: alice(), uid: Uid::from_bytes([4; 32]) }, vec![]);
        storage.commit(&batch).unwrap();

        assert_eq!(storage.delete_identity(&alice()).unwrap(), 2);
        assert!(storage.list_instances(&alice()).unwrap().is_empty());
        assert!(!storage.is_finished(&key(alice(), 3)).unwrap());
        assert!(storage.load_pending(&alice()).unwrap().is_empty());
        assert_eq!(storage.list_instances(&bob()).unwrap().len(), 1);
    }
}
