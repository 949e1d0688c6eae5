//! Server channel.
//!
//! Not a peer channel: a query intent is translated into the fetch
//! collaborator's query type and staged on the unit of work. No network I/O
//! happens here. The response comes back later as a new received message.

use keystep_proto::{
    CryptoIdentity, DeviceUid, MessageId, ProtocolOrigin, ServerQuery, ServerQueryKind, Uid,
};

use crate::{env::Environment, transaction::UnitOfWork};

/// Requests a protocol step can make of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerQueryIntent {
    /// Current devices of an identity
    DeviceDiscovery {
        /// Identity to look up
        identity: CryptoIdentity,
    },
    /// Upload an encrypted blob under a fresh label
    PutUserData {
        /// Label chosen by the caller
        label: Uid,
        /// Encrypted blob
        data: Vec<u8>,
    },
    /// Download a blob uploaded by `identity`
    GetUserData {
        /// Uploader
        identity: CryptoIdentity,
        /// Label chosen by the uploader
        label: Uid,
    },
    /// Create a group blob
    CreateGroupBlob {
        /// Group identifier
        group_uid: Uid,
        /// Encoded blob
        encoded_blob: Vec<u8>,
    },
    /// Fetch a group blob
    GetGroupBlob {
        /// Group identifier
        group_uid: Uid,
    },
    /// Replace a locked group blob
    UpdateGroupBlob {
        /// Group identifier
        group_uid: Uid,
        /// Encoded blob
        encoded_blob: Vec<u8>,
        /// Nonce the lock was requested with
        lock_nonce: Vec<u8>,
    },
    /// Lock a group blob for update
    RequestGroupBlobLock {
        /// Group identifier
        group_uid: Uid,
        /// Nonce identifying the lock holder
        lock_nonce: Vec<u8>,
    },
    /// Delete a group blob
    DeleteGroupBlob {
        /// Group identifier
        group_uid: Uid,
    },
    /// Devices of the owned identity
    OwnedDeviceDiscovery,
    /// Rename an owned device
    SetOwnedDeviceName {
        /// Device to rename
        device: DeviceUid,
        /// Encrypted name
        encrypted_name: Vec<u8>,
    },
    /// Deactivate an owned device
    DeactivateOwnedDevice {
        /// Device to deactivate
        device: DeviceUid,
    },
    /// Open a transfer session on the source device
    TransferSource,
    /// Join a transfer session on the destination device
    TransferDestination {
        /// Session number read from the source device
        session_number: u64,
        /// First payload for the source
        payload: Vec<u8>,
    },
    /// Relay a payload within a transfer session
    TransferRelay {
        /// Connection handle
        connection_identifier: String,
        /// Payload
        payload: Vec<u8>,
    },
    /// Wait for the next transfer payload
    TransferWait,
}

impl From<ServerQueryIntent> for ServerQueryKind {
    fn from(intent: ServerQueryIntent) -> Self {
        match intent {
            ServerQueryIntent::DeviceDiscovery { identity } => Self::DeviceDiscovery { identity },
            ServerQueryIntent::PutUserData { label, data } => Self::PutUserData { label, data },
            ServerQueryIntent::GetUserData { identity, label } => {
                Self::GetUserData { identity, label }
            },
            ServerQueryIntent::CreateGroupBlob { group_uid, encoded_blob } => {
                Self::CreateGroupBlob { group_uid, encoded_blob }
            },
            ServerQueryIntent::GetGroupBlob { group_uid } => Self::GetGroupBlob { group_uid },
            ServerQueryIntent::UpdateGroupBlob { group_uid, encoded_blob, lock_nonce } => {
                Self::UpdateGroupBlob { group_uid, encoded_blob, lock_nonce }
            },
            ServerQueryIntent::RequestGroupBlobLock { group_uid, lock_nonce } => {
                Self::RequestGroupBlobLock { group_uid, lock_nonce }
            },
            ServerQueryIntent::DeleteGroupBlob { group_uid } => Self::DeleteGroupBlob { group_uid },
            ServerQueryIntent::OwnedDeviceDiscovery => Self::OwnedDeviceDiscovery,
            ServerQueryIntent::SetOwnedDeviceName { device, encrypted_name } => {
                Self::SetOwnedDeviceName { device, encrypted_name }
            },
            ServerQueryIntent::DeactivateOwnedDevice { device } => {
                Self::DeactivateOwnedDevice { device }
            },
            ServerQueryIntent::TransferSource => Self::TransferSource,
            ServerQueryIntent::TransferDestination { session_number, payload } => {
                Self::TransferDestination { session_number, payload }
            },
            ServerQueryIntent::TransferRelay { connection_identifier, payload } => {
                Self::TransferRelay { connection_identifier, payload }
            },
            ServerQueryIntent::TransferWait => Self::TransferWait,
        }
    }
}

/// Stage a server query and return a fresh id correlating it.
pub fn post_server_query<E: Environment>(
    uow: &mut UnitOfWork,
    env: &E,
    origin: ProtocolOrigin,
    intent: ServerQueryIntent,
    context: Vec<u8>,
) -> MessageId {
    let owned_identity = uow.owned_identity().clone();
    let kind = ServerQueryKind::from(intent);

    tracing::debug!(
        owned = %owned_identity,
        protocol = %origin.protocol_id,
        instance = ?origin.instance_uid,
        query = ?std::mem::discriminant(&kind),
        "posting server query"
    );

    uow.push_server_query(ServerQuery { owned_identity: owned_identity.clone(), origin, kind, context });
    MessageId { owned_identity, uid: env.random_uid() }
}
