//! Storage abstraction for the protocol executor
//!
//! Persists three things per owned identity: the encoded state of every
//! running protocol instance, a tombstone for every finished instance, and
//! received messages that have not been processed yet. The trait is
//! synchronous; a whole step is written with a single [`Storage::commit`].

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
use keystep_proto::{CryptoIdentity, MessageId, ProtocolId, Uid};
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;

/// Addresses one protocol instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    /// Identity the instance runs for
    pub owned_identity: CryptoIdentity,
    /// Protocol the instance runs
    pub protocol_id: ProtocolId,
    /// Instance identifier, shared by all participants
    pub instance_uid: Uid,
}

/// A running protocol instance as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredInstance {
    /// Instance address
    pub key: InstanceKey,
    /// CBOR encoding of the protocol's state enum
    pub encoded_state: Vec<u8>,
}

/// Writes staged by one step, applied atomically by [`Storage::commit`].
///
/// Later operations on the same key win: finishing an instance after
/// writing it leaves only the tombstone.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StorageBatch {
    instance_writes: Vec<StoredInstance>,
    finished: Vec<InstanceKey>,
    pending_writes: Vec<(MessageId, Vec<u8>)>,
    pending_removals: Vec<MessageId>,
}

impl StorageBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the new state of a running instance.
    pub fn put_instance(&mut self, key: InstanceKey, encoded_state: Vec<u8>) {
        self.finished.retain(|finished| *finished != key);
        self.instance_writes.retain(|write| write.key != key);
        self.instance_writes.push(StoredInstance { key, encoded_state });
    }

    /// Delete an instance and leave a tombstone in its place.
    pub fn finish_instance(&mut self, key: InstanceKey) {
        self.instance_writes.retain(|write| write.key != key);
        if !self.finished.contains(&key) {
            self.finished.push(key);
        }
    }

    /// Persist a received message until it has been processed.
    pub fn put_pending(&mut self, message_id: MessageId, encoded_message: Vec<u8>) {
        self.pending_removals.retain(|removed| *removed != message_id);
        self.pending_writes.retain(|(id, _)| *id != message_id);
        self.pending_writes.push((message_id, encoded_message));
    }

    /// Forget a received message once its step committed or was rejected.
    pub fn remove_pending(&mut self, message_id: MessageId) {
        self.pending_writes.retain(|(id, _)| *id != message_id);
        if !self.pending_removals.contains(&message_id) {
            self.pending_removals.push(message_id);
        }
    }

    /// True if committing the batch would change nothing.
    pub fn is_empty(&self) -> bool {
        self.instance_writes.is_empty()
            && self.finished.is_empty()
            && self.pending_writes.is_empty()
            && self.pending_removals.is_empty()
    }
}

/// Storage abstraction for protocol instances and pending messages
///
/// Must be Clone (shared by the executor and runtime workers), Send + Sync
/// (thread-safe), and synchronous (no async methods). Implementations share
/// internal state via Arc, so clones access the same underlying storage.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Encoded state of an instance. `None` if the instance is not running.
    fn load_instance(&self, key: &InstanceKey) -> Result<Option<Vec<u8>>, StorageError>;

    /// All running instances of an owned identity. Order is not guaranteed.
    fn list_instances(&self, owned: &CryptoIdentity) -> Result<Vec<StoredInstance>, StorageError>;

    /// True if the instance reached a terminal state.
    fn is_finished(&self, key: &InstanceKey) -> Result<bool, StorageError>;

    /// Received messages not yet processed for an owned identity.
    ///
    /// Returns `(message uid, encoded message)` pairs. Order is not
    /// guaranteed.
    fn load_pending(&self, owned: &CryptoIdentity) -> Result<Vec<(Uid, Vec<u8>)>, StorageError>;

    /// Apply every write of `batch`, or none of them.
    fn commit(&self, batch: &StorageBatch) -> Result<(), StorageError>;

    /// Remove instances, tombstones and pending messages of an owned
    /// identity. Returns the number of running instances removed.
    fn delete_identity(&self, owned: &CryptoIdentity) -> Result<usize, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> InstanceKey {
        InstanceKey {
            owned_identity: CryptoIdentity::new("https://server.example", [1; 32]),
            protocol_id: ProtocolId::DeviceDiscovery,
            instance_uid: Uid::from_bytes([byte; 32]),
        }
    }

    fn message_id(byte: u8) -> MessageId {
        MessageId {
            owned_identity: CryptoIdentity::new("https://server.example", [1; 32]),
            uid: Uid::from_bytes([byte; 32]),
        }
    }

    #[test]
    fn finishing_supersedes_earlier_write() {
        let mut batch = StorageBatch::new();
        batch.put_instance(key(1), vec![1]);
        batch.finish_instance(key(1));

        assert!(batch.instance_writes.is_empty());
        assert_eq!(batch.finished, vec![key(1)]);
    }

    #[test]
    fn removing_pending_cancels_staged_write() {
        let mut batch = StorageBatch::new();
        batch.put_pending(message_id(7), vec![7]);
        batch.remove_pending(message_id(7));

        assert!(batch.pending_writes.is_empty());
        assert_eq!(batch.pending_removals, vec![message_id(7)]);
        assert!(!batch.is_empty());
    }

    #[test]
    fn last_state_write_wins() {
        let mut batch = StorageBatch::new();
        batch.put_instance(key(2), vec![1]);
        batch.put_instance(key(2), vec![2]);

        assert_eq!(batch.instance_writes.len(), 1);
        assert_eq!(batch.instance_writes[0].encoded_state, vec![2]);
    }
}
