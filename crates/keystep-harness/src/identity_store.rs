//! In-memory identity collaborator.
//!
//! Holds, per owned identity, its private key, current device, published
//! details and contacts. Mutations requested by protocol steps are staged on
//! the step's unit of work and land only if the step commits. Test setup
//! methods write directly.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use keystep_core::{ContactDetails, IdentityDelegate, IdentityError, PublishedDetails, UnitOfWork};
use keystep_crypto::PrivateKeyForEncryption;
use keystep_proto::{CryptoIdentity, DeviceUid, Uid};

#[derive(Debug, Default, Clone)]
struct ContactRecord {
    devices: BTreeSet<DeviceUid>,
    details: Option<ContactDetails>,
}

#[derive(Clone)]
struct OwnedRecord {
    private_key: [u8; 32],
    device: DeviceUid,
    active: bool,
    published: PublishedDetails,
    contacts: BTreeMap<CryptoIdentity, ContactRecord>,
}

type Records = HashMap<CryptoIdentity, OwnedRecord>;

/// Identity store shared by every executor of one simulated device.
#[derive(Clone, Default)]
pub struct InMemoryIdentityStore {
    inner: Arc<Mutex<Records>>,
}

impl InMemoryIdentityStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an owned identity on this device, with empty details at
    /// version 0.
    pub fn add_owned_identity(
        &self,
        identity: CryptoIdentity,
        private_key: &PrivateKeyForEncryption,
        device: DeviceUid,
    ) {
        lock(&self.inner).insert(
            identity,
            OwnedRecord {
                private_key: private_key.to_bytes(),
                device,
                active: true,
                published: PublishedDetails {
                    version: 0,
                    encoded_details: Vec::new(),
                    photo: None,
                    photo_server_label: None,
                    photo_key: None,
                },
                contacts: BTreeMap::new(),
            },
        );
    }

    /// Make `contact` a contact of `owned`, without devices.
    pub fn add_contact(
        &self,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<(), IdentityError> {
        let mut records = lock(&self.inner);
        let record = owned_record(&mut records, owned)?;
        record.contacts.entry(contact.clone()).or_default();
        Ok(())
    }

    /// Publish new details; returns the new version.
    ///
    /// Any previously uploaded photo label is forgotten.
    pub fn publish_details(
        &self,
        owned: &CryptoIdentity,
        encoded_details: Vec<u8>,
        photo: Option<Vec<u8>>,
    ) -> Result<u64, IdentityError> {
        let mut records = lock(&self.inner);
        let record = owned_record(&mut records, owned)?;
        let version = record.published.version + 1;
        record.published = PublishedDetails {
            version,
            encoded_details,
            photo,
            photo_server_label: None,
            photo_key: None,
        };
        Ok(version)
    }

    /// Activate or deactivate an owned identity.
    pub fn set_active(&self, owned: &CryptoIdentity, active: bool) -> Result<(), IdentityError> {
        let mut records = lock(&self.inner);
        owned_record(&mut records, owned)?.active = active;
        Ok(())
    }

    /// Details last received from `contact`.
    pub fn contact_details(
        &self,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<Option<ContactDetails>, IdentityError> {
        let mut records = lock(&self.inner);
        let record = owned_record(&mut records, owned)?;
        let contact_record = record
            .contacts
            .get(contact)
            .ok_or_else(|| IdentityError::UnknownContact(contact.clone()))?;
        Ok(contact_record.details.clone())
    }
}

impl IdentityDelegate for InMemoryIdentityStore {
    fn is_owned_identity(&self, identity: &CryptoIdentity) -> Result<bool, IdentityError> {
        Ok(lock(&self.inner).contains_key(identity))
    }

    fn is_active(&self, owned: &CryptoIdentity) -> Result<bool, IdentityError> {
        read(&self.inner, owned, |record| record.active)
    }

    fn current_device_uid(&self, owned: &CryptoIdentity) -> Result<DeviceUid, IdentityError> {
        read(&self.inner, owned, |record| record.device)
    }

    fn owned_private_key(
        &self,
        owned: &CryptoIdentity,
    ) -> Result<PrivateKeyForEncryption, IdentityError> {
        let bytes = read(&self.inner, owned, |record| record.private_key)?;
        PrivateKeyForEncryption::from_bytes(bytes)
            .map_err(|err| IdentityError::Store(err.to_string()))
    }

    fn owned_device_uids(&self, owned: &CryptoIdentity) -> Result<Vec<DeviceUid>, IdentityError> {
        read(&self.inner, owned, |record| vec![record.device])
    }

    fn contacts(&self, owned: &CryptoIdentity) -> Result<Vec<CryptoIdentity>, IdentityError> {
        read(&self.inner, owned, |record| record.contacts.keys().cloned().collect())
    }

    fn is_contact(
        &self,
        owned: &CryptoIdentity,
        identity: &CryptoIdentity,
    ) -> Result<bool, IdentityError> {
        read(&self.inner, owned, |record| record.contacts.contains_key(identity))
    }

    fn contact_device_uids(
        &self,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<Vec<DeviceUid>, IdentityError> {
        read(&self.inner, owned, |record| {
            record.contacts.get(contact).map(|c| c.devices.iter().copied().collect())
        })?
        .ok_or_else(|| IdentityError::UnknownContact(contact.clone()))
    }

    fn published_details(&self, owned: &CryptoIdentity) -> Result<PublishedDetails, IdentityError> {
        read(&self.inner, owned, |record| record.published.clone())
    }

    fn contact_published_version(
        &self,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<Option<u64>, IdentityError> {
        read(&self.inner, owned, |record| {
            record.contacts.get(contact).and_then(|c| c.details.as_ref()).map(|d| d.version)
        })
    }

    fn set_photo_server_label(
        &self,
        uow: &mut UnitOfWork,
        owned: &CryptoIdentity,
        version: u64,
        label: Uid,
        key: [u8; 32],
    ) -> Result<(), IdentityError> {
        read(&self.inner, owned, |_| ())?;
        let inner = Arc::clone(&self.inner);
        let owned = owned.clone();
        uow.defer(move || {
            let mut records = lock(&inner);
            if let Some(record) = records.get_mut(&owned)
                && record.published.version == version
            {
                record.published.photo_server_label = Some(label);
                record.published.photo_key = Some(key);
            }
        });
        Ok(())
    }

    fn update_contact_published_details(
        &self,
        uow: &mut UnitOfWork,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
        details: ContactDetails,
    ) -> Result<(), IdentityError> {
        if !self.is_contact(owned, contact)? {
            return Err(IdentityError::UnknownContact(contact.clone()));
        }
        let inner = Arc::clone(&self.inner);
        let owned = owned.clone();
        let contact = contact.clone();
        uow.defer(move || {
            let mut records = lock(&inner);
            if let Some(record) = records.get_mut(&owned).and_then(|r| r.contacts.get_mut(&contact)) {
                record.details = Some(details);
            }
        });
        Ok(())
    }

    fn add_contact_device(
        &self,
        uow: &mut UnitOfWork,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
        device: DeviceUid,
    ) -> Result<bool, IdentityError> {
        if self.contact_device_uids(owned, contact)?.contains(&device) {
            return Ok(false);
        }
        let inner = Arc::clone(&self.inner);
        let owned = owned.clone();
        let contact = contact.clone();
        uow.defer(move || {
            let mut records = lock(&inner);
            if let Some(record) = records.get_mut(&owned).and_then(|r| r.contacts.get_mut(&contact)) {
                record.devices.insert(device);
            }
        });
        Ok(true)
    }
}

fn lock(inner: &Mutex<Records>) -> MutexGuard<'_, Records> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn owned_record<'a>(
    records: &'a mut Records,
    owned: &CryptoIdentity,
) -> Result<&'a mut OwnedRecord, IdentityError> {
    records.get_mut(owned).ok_or_else(|| IdentityError::UnknownOwnedIdentity(owned.clone()))
}

fn read<T>(
    inner: &Mutex<Records>,
    owned: &CryptoIdentity,
    f: impl FnOnce(&OwnedRecord) -> T,
) -> Result<T, IdentityError> {
    lock(inner)
        .get(owned)
        .map(f)
        .ok_or_else(|| IdentityError::UnknownOwnedIdentity(owned.clone()))
}

#[cfg(test)]
mod tests {
    use keystep_crypto::{EncryptionKeyPair, wrap::KEYPAIR_RANDOMNESS_SIZE};

    use super::*;

    fn owned(store: &InMemoryIdentityStore, seed: u8) -> CryptoIdentity {
        let keys = EncryptionKeyPair::generate(&[seed; KEYPAIR_RANDOMNESS_SIZE]);
        let identity = CryptoIdentity::new("https://server.keystep.test", keys.public_key().to_bytes());
        store.add_owned_identity(identity.clone(), keys.private_key(), DeviceUid(Uid::from_bytes([seed; 32])));
        identity
    }

    #[test]
    fn staged_mutations_wait_for_commit() {
        let store = InMemoryIdentityStore::new();
        let alice = owned(&store, 1);
        let bob = CryptoIdentity::new("https://server.keystep.test", [2; 32]);
        store.add_contact(&alice, &bob).unwrap();

        let device = DeviceUid(Uid::from_bytes([3; 32]));
        let mut uow = UnitOfWork::new(alice.clone());
        assert!(store.add_contact_device(&mut uow, &alice, &bob, device).unwrap());
        assert!(store.contact_device_uids(&alice, &bob).unwrap().is_empty());

        uow.rollback();
        assert!(store.contact_device_uids(&alice, &bob).unwrap().is_empty());
    }

    #[test]
    fn publishing_bumps_version_and_forgets_label() {
        let store = InMemoryIdentityStore::new();
        let alice = owned(&store, 1);

        assert_eq!(store.publish_details(&alice, b"alice".to_vec(), None).unwrap(), 1);
        assert_eq!(store.publish_details(&alice, b"alice2".to_vec(), Some(vec![1])).unwrap(), 2);

        let published = store.published_details(&alice).unwrap();
        assert_eq!(published.version, 2);
        assert_eq!(published.photo_server_label, None);
    }

    #[test]
    fn unknown_identity_is_an_error() {
        let store = InMemoryIdentityStore::new();
        let stranger = CryptoIdentity::new("https://server.keystep.test", [9; 32]);

        assert!(!store.is_owned_identity(&stranger).unwrap());
        assert_eq!(
            store.published_details(&stranger),
            Err(IdentityError::UnknownOwnedIdentity(stranger))
        );
    }
}
