//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. A
//! [`StorageBatch`] maps to exactly one write transaction, so a crash while
//! committing a step leaves the previous state and the pending message.

use std::{path::Path, sync::Arc};

use keystep_proto::{CryptoIdentity, UID_LEN, Uid};
use redb::{Database, ReadableTable, TableDefinition};

use super::{InstanceKey, Storage, StorageBatch, StorageError, StoredInstance};

/// Table: instances
/// Key: identity prefix ‖ protocol id (2 bytes BE) ‖ instance uid
/// Value: CBOR-encoded StoredInstance
const INSTANCES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("instances");

/// Table: finished
/// Key: same layout as INSTANCES
/// Value: empty
const FINISHED: TableDefinition<&[u8], &[u8]> = TableDefinition::new("finished");

/// Table: pending
/// Key: identity prefix ‖ message uid
/// Value: encoded received message
const PENDING: TableDefinition<&[u8], &[u8]> = TableDefinition::new("pending");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (INSTANCES, FINISHED, PENDING).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(INSTANCES).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(FINISHED).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(PENDING).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }
}

/// Keys of `table` starting with `prefix`, in key order.
fn keys_with_prefix<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    prefix: &[u8],
) -> Result<Vec<Vec<u8>>, StorageError> {
    let mut keys = Vec::new();
    for result in table.range(prefix..).map_err(|e| StorageError::Io(e.to_string()))? {
        let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_vec());
    }
    Ok(keys)
}

impl Storage for RedbStorage {
    fn load_instance(&self, key: &InstanceKey) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(INSTANCES).map_err(|e| StorageError::Io(e.to_string()))?;

        let encoded_key = encode_instance_key(key);
        match table.get(encoded_key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => {
                let stored: StoredInstance = ciborium::from_reader(value.value())
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(stored.encoded_state))
            },
            None => Ok(None),
        }
    }

    fn list_instances(&self, owned: &CryptoIdentity) -> Result<Vec<StoredInstance>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(INSTANCES).map_err(|e| StorageError::Io(e.to_string()))?;

        let prefix = encode_identity_prefix(owned);
        let mut instances = Vec::new();
        for result in table.range(prefix.as_slice()..).map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let stored: StoredInstance = ciborium::from_reader(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            instances.push(stored);
        }

        Ok(instances)
    }

    fn is_finished(&self, key: &InstanceKey) -> Result<bool, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(FINISHED).map_err(|e| StorageError::Io(e.to_string()))?;

        let encoded_key = encode_instance_key(key);
        Ok(table
            .get(encoded_key.as_slice())
            .map_err(|e| StorageError::Io(e.to_string()))?
            .is_some())
    }

    fn load_pending(&self, owned: &CryptoIdentity) -> Result<Vec<(Uid, Vec<u8>)>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(PENDING).map_err(|e| StorageError::Io(e.to_string()))?;

        let prefix = encode_identity_prefix(owned);
        let mut pending = Vec::new();
        for result in table.range(prefix.as_slice()..).map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let key = key.value();
            if !key.starts_with(&prefix) {
                break;
            }
            let uid = decode_trailing_uid(key)?;
            pending.push((uid, value.value().to_vec()));
        }

        Ok(pending)
    }

    fn commit(&self, batch: &StorageBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut instances =
                txn.open_table(INSTANCES).map_err(|e| StorageError::Io(e.to_string()))?;
            let mut finished =
                txn.open_table(FINISHED).map_err(|e| StorageError::Io(e.to_string()))?;
            let mut pending = txn.open_table(PENDING).map_err(|e| StorageError::Io(e.to_string()))?;

            for write in &batch.instance_writes {
                let mut bytes = Vec::new();
                ciborium::into_writer(write, &mut bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;

                let key = encode_instance_key(&write.key);
                instances
                    .insert(key.as_slice(), bytes.as_slice())
                    .map_err(|e| StorageError::Io(e.to_string()))?;
            }

            let tombstone: &[u8] = &[];
            for instance in &batch.finished {
                let key = encode_instance_key(instance);
                instances.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
                finished
                    .insert(key.as_slice(), tombstone)
                    .map_err(|e| StorageError::Io(e.to_string()))?;
            }

            for message_id in &batch.pending_removals {
                let key = encode_pending_key(&message_id.owned_identity, &message_id.uid);
                pending.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            }

            for (message_id, encoded) in &batch.pending_writes {
                let key = encode_pending_key(&message_id.owned_identity, &message_id.uid);
                pending
                    .insert(key.as_slice(), encoded.as_slice())
                    .map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn delete_identity(&self, owned: &CryptoIdentity) -> Result<usize, StorageError> {
        let prefix = encode_identity_prefix(owned);
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let removed = {
            let mut instances =
                txn.open_table(INSTANCES).map_err(|e| StorageError::Io(e.to_string()))?;
            let mut finished =
                txn.open_table(FINISHED).map_err(|e| StorageError::Io(e.to_string()))?;
            let mut pending = txn.open_table(PENDING).map_err(|e| StorageError::Io(e.to_string()))?;

            let instance_keys = keys_with_prefix(&instances, &prefix)?;
            for key in &instance_keys {
                instances.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            }
            for key in keys_with_prefix(&finished, &prefix)? {
                finished.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            }
            for key in keys_with_prefix(&pending, &prefix)? {
                pending.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
            }

            instance_keys.len()
        };

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(removed)
    }
}

/// Identity part of every key.
///
/// The canonical identity encoding is self-delimiting, so one identity's keys
/// are never a prefix of another's.
fn encode_identity_prefix(owned: &CryptoIdentity) -> Vec<u8> {
    owned.encoded()
}

/// Layout: [identity prefix][protocol id: 2 bytes BE][instance uid: 32 bytes]
fn encode_instance_key(key: &InstanceKey) -> Vec<u8> {
    let mut encoded = encode_identity_prefix(&key.owned_identity);
    encoded.extend_from_slice(&key.protocol_id.to_u16().to_be_bytes());
    encoded.extend_from_slice(key.instance_uid.as_bytes());
    encoded
}

/// Layout: [identity prefix][message uid: 32 bytes]
fn encode_pending_key(owned: &CryptoIdentity, uid: &Uid) -> Vec<u8> {
    let mut encoded = encode_identity_prefix(owned);
    encoded.extend_from_slice(uid.as_bytes());
    encoded
}

fn decode_trailing_uid(key: &[u8]) -> Result<Uid, StorageError> {
    let Some(start) = key.len().checked_sub(UID_LEN) else {
        return Err(StorageError::Serialization("pending key too short".to_string()));
    };
    let mut bytes = [0u8; UID_LEN];
    bytes.copy_from_slice(&key[start..]);
    Ok(Uid::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use keystep_proto::{MessageId, ProtocolId};
    use tempfile::tempdir;

    use super::*;

    fn alice() -> CryptoIdentity {
        CryptoIdentity::new("https://server.example", [1; 32])
    }

    fn key(byte: u8) -> InstanceKey {
        InstanceKey {
            owned_identity: alice(),
            protocol_id: ProtocolId::ChannelCreationWithContactDevice,
            instance_uid: Uid::from_bytes([byte; 32]),
        }
    }

    #[test]
    fn test_identity_prefix_is_not_shared() {
        let short = CryptoIdentity::new("https://a.example", [1; 32]);
        let long = CryptoIdentity::new("https://a.example/x", [1; 32]);
        let short_prefix = encode_identity_prefix(&short);
        let long_prefix = encode_identity_prefix(&long);
        assert!(!long_prefix.starts_with(&short_prefix));
    }

    #[test]
    fn test_pending_key_round_trips_uid() {
        let uid = Uid::from_bytes([0x42; 32]);
        let key = encode_pending_key(&alice(), &uid);
        assert_eq!(decode_trailing_uid(&key).unwrap(), uid);
        assert!(decode_trailing_uid(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keystep.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            let mut batch = StorageBatch::new();
            batch.put_instance(key(1), vec![9, 9]);
            batch.finish_instance(key(2));
            batch.put_pending(MessageId { owned_identity: alice(), uid: Uid::from_bytes([3; 32]) }, vec![3]);
            storage.commit(&batch).unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        assert_eq!(storage.load_instance(&key(1)).unwrap(), Some(vec![9, 9]));
        assert!(storage.is_finished(&key(2)).unwrap());
        assert_eq!(
            storage.load_pending(&alice()).unwrap(),
            vec![(Uid::from_bytes([3; 32]), vec![3])]
        );
    }

    #[test]
    fn test_delete_identity() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("keystep.redb")).unwrap();
        let other = CryptoIdentity::new("https://server.example", [2; 32]);

        let mut batch = StorageBatch::new();
        batch.put_instance(key(1), vec![1]);
        batch.put_instance(key(2), vec![2]);
        batch.finish_instance(key(3));
        batch.put_instance(
            InstanceKey { owned_identity: other.clone(), ..key(1) },
            vec![1],
        );
        storage.commit(&batch).unwrap();

        assert_eq!(storage.delete_identity(&alice()).unwrap(), 2);
        assert!(storage.list_instances(&alice()).unwrap().is_empty());
        assert!(!storage.is_finished(&key(3)).unwrap());
        assert_eq!(storage.list_instances(&other).unwrap().len(), 1);
    }
}
