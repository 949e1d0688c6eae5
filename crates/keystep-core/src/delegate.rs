//! Collaborator interfaces consumed by the engine.
//!
//! The engine owns protocol state and nothing else. Identities, contacts,
//! confirmed device channels and the network are supplied by collaborators
//! bound at construction through [`Collaborators`].
//!
//! Reads happen immediately. Mutations take the step's [`UnitOfWork`] and
//! must be staged on it with [`UnitOfWork::defer`], so they only take effect
//! if the step commits.

use std::sync::Arc;

use keystep_crypto::{AuthenticatedEncryptionKey, PrivateKeyForEncryption};
use keystep_proto::{CryptoIdentity, DeviceUid, Envelope, ServerQuery, Uid};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ChannelError, IdentityError},
    transaction::UnitOfWork,
};

/// Details an owned identity publishes to its contacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedDetails {
    /// Monotonic version, bumped on every edit
    pub version: u64,
    /// Encoded display details (name, company, ...), opaque to the engine
    pub encoded_details: Vec<u8>,
    /// Profile photo awaiting or past upload
    pub photo: Option<Vec<u8>>,
    /// Server label of the uploaded photo for this version
    pub photo_server_label: Option<Uid>,
    /// Key the uploaded photo is sealed with
    pub photo_key: Option<[u8; 32]>,
}

/// Details as sent to, and stored for, a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDetails {
    /// Version of the publisher's details
    pub version: u64,
    /// Encoded display details
    pub encoded_details: Vec<u8>,
    /// Where the photo can be downloaded from
    pub photo_server_label: Option<Uid>,
    /// Key to open the downloaded photo
    pub photo_key: Option<[u8; 32]>,
}

impl From<&PublishedDetails> for ContactDetails {
    fn from(details: &PublishedDetails) -> Self {
        Self {
            version: details.version,
            encoded_details: details.encoded_details.clone(),
            photo_server_label: details.photo_server_label,
            photo_key: details.photo_key,
        }
    }
}

/// Identity storage: owned identities, contacts and their devices.
pub trait IdentityDelegate: Send + Sync {
    /// True if `identity` is owned on this device.
    fn is_owned_identity(&self, identity: &CryptoIdentity) -> Result<bool, IdentityError>;

    /// True if the owned identity may run protocols.
    fn is_active(&self, owned: &CryptoIdentity) -> Result<bool, IdentityError>;

    /// This device's uid for the owned identity.
    fn current_device_uid(&self, owned: &CryptoIdentity) -> Result<DeviceUid, IdentityError>;

    /// Private key matching the owned identity's encryption key.
    fn owned_private_key(
        &self,
        owned: &CryptoIdentity,
    ) -> Result<PrivateKeyForEncryption, IdentityError>;

    /// Other devices of the owned identity.
    fn owned_device_uids(&self, owned: &CryptoIdentity) -> Result<Vec<DeviceUid>, IdentityError>;

    /// Contacts of the owned identity.
    fn contacts(&self, owned: &CryptoIdentity) -> Result<Vec<CryptoIdentity>, IdentityError>;

    /// True if `contact` is a contact of the owned identity.
    fn is_contact(
        &self,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<bool, IdentityError>;

    /// Known devices of a contact.
    fn contact_device_uids(
        &self,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<Vec<DeviceUid>, IdentityError>;

    /// The owned identity's current published details.
    fn published_details(&self, owned: &CryptoIdentity) -> Result<PublishedDetails, IdentityError>;

    /// Version of the details last received from a contact.
    fn contact_published_version(
        &self,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<Option<u64>, IdentityError>;

    /// Record where the photo of `version` was uploaded.
    fn set_photo_server_label(
        &self,
        uow: &mut UnitOfWork,
        owned: &CryptoIdentity,
        version: u64,
        label: Uid,
        key: [u8; 32],
    ) -> Result<(), IdentityError>;

    /// Store details received from a contact.
    fn update_contact_published_details(
        &self,
        uow: &mut UnitOfWork,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
        details: ContactDetails,
    ) -> Result<(), IdentityError>;

    /// Add a device to a contact. Returns false if it was already known.
    fn add_contact_device(
        &self,
        uow: &mut UnitOfWork,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
        device: DeviceUid,
    ) -> Result<bool, IdentityError>;
}

/// Established device-to-device channels with evolving key material.
///
/// The ratchet state lives with the implementation; the engine only asks it
/// to wrap and unwrap message keys.
pub trait ObliviousChannelDelegate: Send + Sync {
    /// Devices of `remote` with a confirmed channel from the owned identity.
    ///
    /// `remote == owned` lists channels to the owned identity's other devices.
    fn confirmed_channel_devices(
        &self,
        owned: &CryptoIdentity,
        remote: &CryptoIdentity,
    ) -> Result<Vec<DeviceUid>, ChannelError>;

    /// Wrap `key` with the channel's next send key. `None` if no channel.
    fn wrap_message_key(
        &self,
        owned: &CryptoIdentity,
        remote: &CryptoIdentity,
        remote_device: DeviceUid,
        key: &AuthenticatedEncryptionKey,
    ) -> Option<Vec<u8>>;

    /// Unwrap a key wrapped by the remote end of one of our channels.
    ///
    /// Returns the key with the authenticated sender, `None` if no channel
    /// recognizes the wrapped bytes.
    fn unwrap_message_key(
        &self,
        owned: &CryptoIdentity,
        wrapped: &[u8],
    ) -> Option<(AuthenticatedEncryptionKey, CryptoIdentity, DeviceUid)>;

    /// Create a confirmed channel from a seed both ends agreed on.
    fn create_channel(
        &self,
        uow: &mut UnitOfWork,
        owned: &CryptoIdentity,
        remote: &CryptoIdentity,
        remote_device: DeviceUid,
        seed: [u8; 32],
    ) -> Result<(), ChannelError>;
}

/// Accepts server queries for asynchronous processing.
///
/// Responses come back later through
/// [`crate::ProtocolExecutor::receive_server_response`].
pub trait NetworkFetchDelegate: Send + Sync {
    /// Enqueue a query. Must not block on the network.
    fn post_server_query(&self, query: ServerQuery);
}

/// Accepts sealed envelopes for upload.
pub trait NetworkSendDelegate: Send + Sync {
    /// Enqueue an envelope. Must not block on the network.
    fn post_envelope(&self, envelope: Envelope);
}

/// Every collaborator the engine talks to, bound once at construction.
#[derive(Clone)]
pub struct Collaborators {
    /// Identity storage
    pub identity: Arc<dyn IdentityDelegate>,
    /// Server query sink
    pub network_fetch: Arc<dyn NetworkFetchDelegate>,
    /// Envelope sink
    pub network_send: Arc<dyn NetworkSendDelegate>,
    /// Device channels, absent on devices that only use asymmetric channels
    pub oblivious: Option<Arc<dyn ObliviousChannelDelegate>>,
}

impl Collaborators {
    /// Oblivious channel collaborator, or `MissingDelegate`.
    pub fn oblivious(&self) -> Result<&dyn ObliviousChannelDelegate, ChannelError> {
        self.oblivious.as_deref().ok_or(ChannelError::MissingDelegate("oblivious channel"))
    }
}
