//! Unit of work: the transactional scope of one protocol step.
//!
//! A step never writes anything directly. Instance state, tombstones,
//! outbound envelopes, server queries, local deliveries and collaborator
//! mutations are all staged on a [`UnitOfWork`]. [`UnitOfWork::commit`]
//! applies them in a fixed order:
//!
//! ```text
//! storage batch (atomic) ──► deferred mutations ──► envelopes ──► queries
//! ```
//!
//! If the storage batch fails nothing else happens. Dropping a unit of work
//! without committing discards everything it staged.

use std::mem;

use keystep_proto::{CryptoIdentity, Envelope, MessageId, ServerQuery, encoding};

use crate::{
    channel::ReceivedMessage,
    delegate::Collaborators,
    storage::{InstanceKey, Storage, StorageBatch, StorageError},
};

type DeferredMutation = Box<dyn FnOnce() + Send>;

/// Staged effects of one step for one owned identity.
pub struct UnitOfWork {
    owned_identity: CryptoIdentity,
    batch: StorageBatch,
    envelopes: Vec<Envelope>,
    server_queries: Vec<ServerQuery>,
    local_deliveries: Vec<ReceivedMessage>,
    deferred: Vec<DeferredMutation>,
    committed: bool,
}

/// What a commit handed to collaborators, plus local messages still to run.
#[derive(Debug, Default)]
pub struct CommitReport {
    /// Local messages, already persisted as pending, for the executor to run
    pub local_deliveries: Vec<ReceivedMessage>,
    /// Envelopes handed to the send collaborator
    pub envelopes_posted: usize,
    /// Queries handed to the fetch collaborator
    pub queries_posted: usize,
}

impl UnitOfWork {
    /// Open an empty unit of work.
    pub fn new(owned_identity: CryptoIdentity) -> Self {
        Self {
            owned_identity,
            batch: StorageBatch::new(),
            envelopes: Vec::new(),
            server_queries: Vec::new(),
            local_deliveries: Vec::new(),
            deferred: Vec::new(),
            committed: false,
        }
    }

    /// Identity this unit of work acts for.
    pub fn owned_identity(&self) -> &CryptoIdentity {
        &self.owned_identity
    }

    /// Stage a collaborator mutation to run after storage commits.
    pub fn defer(&mut self, mutation: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(mutation));
    }

    /// Number of envelopes staged so far.
    pub fn staged_envelopes(&self) -> usize {
        self.envelopes.len()
    }

    /// Number of server queries staged so far.
    pub fn staged_queries(&self) -> usize {
        self.server_queries.len()
    }

    /// True if nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
            && self.envelopes.is_empty()
            && self.server_queries.is_empty()
            && self.local_deliveries.is_empty()
            && self.deferred.is_empty()
    }

    pub(crate) fn put_instance(&mut self, key: InstanceKey, encoded_state: Vec<u8>) {
        self.batch.put_instance(key, encoded_state);
    }

    pub(crate) fn finish_instance(&mut self, key: InstanceKey) {
        self.batch.finish_instance(key);
    }

    pub(crate) fn mark_processed(&mut self, message_id: MessageId) {
        self.batch.remove_pending(message_id);
    }

    pub(crate) fn push_envelope(&mut self, envelope: Envelope) {
        self.envelopes.push(envelope);
    }

    pub(crate) fn push_server_query(&mut self, query: ServerQuery) {
        self.server_queries.push(query);
    }

    /// Stage a local delivery and persist it as pending in the same batch.
    pub(crate) fn push_local_delivery(
        &mut self,
        message: ReceivedMessage,
    ) -> keystep_proto::Result<()> {
        let encoded = encoding::encode(&message)?;
        self.batch.put_pending(message.message_id.clone(), encoded);
        self.local_deliveries.push(message);
        Ok(())
    }

    /// Apply everything staged.
    ///
    /// # Errors
    ///
    /// `StorageError` if the batch could not be written. In that case no
    /// mutation runs and nothing is posted.
    pub fn commit<S: Storage>(
        mut self,
        storage: &S,
        collaborators: &Collaborators,
    ) -> Result<CommitReport, StorageError> {
        storage.commit(&self.batch)?;
        self.committed = true;

        for mutation in mem::take(&mut self.deferred) {
            mutation();
        }

        let envelopes = mem::take(&mut self.envelopes);
        let envelopes_posted = envelopes.len();
        for envelope in envelopes {
            collaborators.network_send.post_envelope(envelope);
        }

        let queries = mem::take(&mut self.server_queries);
        let queries_posted = queries.len();
        for query in queries {
            collaborators.network_fetch.post_server_query(query);
        }

        Ok(CommitReport {
            local_deliveries: mem::take(&mut self.local_deliveries),
            envelopes_posted,
            queries_posted,
        })
    }

    /// Discard everything staged.
    pub fn rollback(self) {
        drop(self);
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if !self.committed && !self.is_empty() {
            tracing::debug!(
                owned = %self.owned_identity,
                envelopes = self.envelopes.len(),
                queries = self.server_queries.len(),
                mutations = self.deferred.len(),
                "unit of work rolled back"
            );
        }
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("owned_identity", &self.owned_identity)
            .field("batch", &self.batch)
            .field("envelopes", &self.envelopes.len())
            .field("server_queries", &self.server_queries.len())
            .field("local_deliveries", &self.local_deliveries.len())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use keystep_crypto::PrivateKeyForEncryption;
    use keystep_proto::{DeviceUid, Uid};

    use super::*;
    use crate::{
        delegate::{
            ContactDetails, IdentityDelegate, NetworkFetchDelegate, NetworkSendDelegate,
            PublishedDetails,
        },
        error::IdentityError,
        storage::{ChaoticStorage, MemoryStorage},
    };

    struct NoIdentities;

    impl IdentityDelegate for NoIdentities {
        fn is_owned_identity(&self, _: &CryptoIdentity) -> Result<bool, IdentityError> {
            Ok(false)
        }
        fn is_active(&self, _: &CryptoIdentity) -> Result<bool, IdentityError> {
            Ok(false)
        }
        fn current_device_uid(&self, owned: &CryptoIdentity) -> Result<DeviceUid, IdentityError> {
            Err(IdentityError::UnknownOwnedIdentity(owned.clone()))
        }
        fn owned_private_key(
            &self,
            owned: &CryptoIdentity,
        ) -> Result<PrivateKeyForEncryption, IdentityError> {
            Err(IdentityError::UnknownOwnedIdentity(owned.clone()))
        }
        fn owned_device_uids(&self, _: &CryptoIdentity) -> Result<Vec<DeviceUid>, IdentityError> {
            Ok(Vec::new())
        }
        fn contacts(&self, _: &CryptoIdentity) -> Result<Vec<CryptoIdentity>, IdentityError> {
            Ok(Vec::new())
        }
        fn is_contact(&self, _: &CryptoIdentity, _: &CryptoIdentity) -> Result<bool, IdentityError> {
            Ok(false)
        }
        fn contact_device_uids(
            &self,
            _: &CryptoIdentity,
            _: &CryptoIdentity,
        ) -> Result<Vec<DeviceUid>, IdentityError> {
            Ok(Vec::new())
        }
        fn published_details(&self, owned: &CryptoIdentity) -> Result<PublishedDetails, IdentityError> {
            Err(IdentityError::UnknownOwnedIdentity(owned.clone()))
        }
        fn contact_published_version(
            &self,
            _: &CryptoIdentity,
            _: &CryptoIdentity,
        ) -> Result<Option<u64>, IdentityError> {
            Ok(None)
        }
        fn set_photo_server_label(
            &self,
            _: &mut UnitOfWork,
            _: &CryptoIdentity,
            _: u64,
            _: Uid,
            _: [u8; 32],
        ) -> Result<(), IdentityError> {
            Ok(())
        }
        fn update_contact_published_details(
            &self,
            _: &mut UnitOfWork,
            _: &CryptoIdentity,
            _: &CryptoIdentity,
            _: ContactDetails,
        ) -> Result<(), IdentityError> {
            Ok(())
        }
        fn add_contact_device(
            &self,
            _: &mut UnitOfWork,
            _: &CryptoIdentity,
            _: &CryptoIdentity,
            _: DeviceUid,
        ) -> Result<bool, IdentityError> {
            Ok(false)
        }
    }

    #[derive(Default)]
    struct Outbox {
        envelopes: Mutex<Vec<Envelope>>,
        queries: Mutex<Vec<ServerQuery>>,
    }

    impl NetworkSendDelegate for Outbox {
        fn post_envelope(&self, envelope: Envelope) {
            self.envelopes.lock().unwrap().push(envelope);
        }
    }

    impl NetworkFetchDelegate for Outbox {
        fn post_server_query(&self, query: ServerQuery) {
            self.queries.lock().unwrap().push(query);
        }
    }

    fn collaborators(outbox: &Arc<Outbox>) -> Collaborators {
        Collaborators {
            identity: Arc::new(NoIdentities),
            network_fetch: outbox.clone(),
            network_send: outbox.clone(),
            oblivious: None,
        }
    }

    fn alice() -> CryptoIdentity {
        CryptoIdentity::new("https://server.example", [1; 32])
    }

    fn envelope() -> Envelope {
        Envelope {
            message_uid: Uid::from_bytes([1; 32]),
            to_identity: alice(),
            to_devices: Vec::new(),
            wrapped_key: vec![1],
            encrypted_content: bytes::Bytes::from_static(b"sealed"),
        }
    }

    #[test]
    fn commit_applies_mutations_then_posts() {
        let outbox = Arc::new(Outbox::default());
        let storage = MemoryStorage::new();
        let applied = Arc::new(AtomicUsize::new(0));

        let mut uow = UnitOfWork::new(alice());
        let counter = applied.clone();
        uow.defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        uow.push_envelope(envelope());

        let report = uow.commit(&storage, &collaborators(&outbox)).unwrap();
        assert_eq!(report.envelopes_posted, 1);
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert_eq!(outbox.envelopes.lock().unwrap().len(), 1);
    }

    #[test]
    fn dropped_unit_of_work_has_no_effect() {
        let applied = Arc::new(AtomicUsize::new(0));

        let mut uow = UnitOfWork::new(alice());
        let counter = applied.clone();
        uow.defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        uow.push_envelope(envelope());
        uow.rollback();

        assert_eq!(applied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_storage_commit_posts_nothing() {
        let outbox = Arc::new(Outbox::default());
        let storage = ChaoticStorage::new(MemoryStorage::new(), 1.0);
        let applied = Arc::new(AtomicUsize::new(0));

        let mut uow = UnitOfWork::new(alice());
        let counter = applied.clone();
        uow.defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        uow.push_envelope(envelope());

        assert!(uow.commit(&storage, &collaborators(&outbox)).is_err());
        assert_eq!(applied.load(Ordering::SeqCst), 0);
        assert!(outbox.envelopes.lock().unwrap().is_empty());
    }
}
