//! Queries posted to the identity server and their responses.
//!
//! A query carries the `(protocol, instance)` that posted it and an opaque
//! `context` blob. The network layer echoes both back on the response, which
//! is how the answer finds its way to the right protocol step.

use serde::{Deserialize, Serialize};

use crate::{
    identity::CryptoIdentity,
    message::ProtocolId,
    uid::{DeviceUid, Uid},
};

/// The protocol instance a query was posted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolOrigin {
    /// Protocol that posted the query
    pub protocol_id: ProtocolId,
    /// Instance that posted the query
    pub instance_uid: Uid,
}

/// Every request the engine can make of the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerQueryKind {
    /// List the devices of an identity
    DeviceDiscovery {
        /// Identity whose devices are listed
        identity: CryptoIdentity,
    },
    /// Store an encrypted blob under a label owned by the caller
    PutUserData {
        /// Storage label
        label: Uid,
        /// Encrypted payload
        data: Vec<u8>,
    },
    /// Fetch a blob stored by another identity
    GetUserData {
        /// Identity that stored the blob
        identity: CryptoIdentity,
        /// Storage label
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
    /// Replace a group blob while holding its lock
    UpdateGroupBlob {
        /// Group identifier
        group_uid: Uid,
        /// Encoded blob
        encoded_blob: Vec<u8>,
        /// Nonce returned when the lock was granted
        lock_nonce: Vec<u8>,
    },
    /// Ask for the update lock of a group blob
    RequestGroupBlobLock {
        /// Group identifier
        group_uid: Uid,
        /// Caller-chosen nonce identifying the lock holder
        lock_nonce: Vec<u8>,
    },
    /// Delete a group blob
    DeleteGroupBlob {
        /// Group identifier
        group_uid: Uid,
    },
    /// List the caller's own devices
    OwnedDeviceDiscovery,
    /// Rename one of the caller's own devices
    SetOwnedDeviceName {
        /// Device to rename
        device: DeviceUid,
        /// Encrypted display name
        encrypted_name: Vec<u8>,
    },
    /// Deactivate one of the caller's own devices
    DeactivateOwnedDevice {
        /// Device to deactivate
        device: DeviceUid,
    },
    /// Open a transfer session as the source device
    TransferSource,
    /// Join a transfer session as the destination device
    TransferDestination {
        /// Session number shown on the source device
        session_number: u64,
        /// First payload for the source
        payload: Vec<u8>,
    },
    /// Relay a payload inside an open transfer session
    TransferRelay {
        /// Connection handle from the transfer service
        connection_identifier: String,
        /// Payload to relay
        payload: Vec<u8>,
    },
    /// Wait for the next payload of an open transfer session
    TransferWait,
}

/// A query as handed to the network fetch collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerQuery {
    /// Identity the query is made on behalf of
    pub owned_identity: CryptoIdentity,
    /// Where the response must be routed
    pub origin: ProtocolOrigin,
    /// The request itself
    pub kind: ServerQueryKind,
    /// Opaque bytes echoed back on the response
    pub context: Vec<u8>,
}

impl ServerQuery {
    /// Build the response to this query.
    pub fn respond(&self, result: ServerResponseKind) -> ServerResponse {
        ServerResponse {
            owned_identity: self.owned_identity.clone(),
            origin: self.origin,
            context: self.context.clone(),
            result,
        }
    }
}

/// Server answers, one variant per query kind plus a generic failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerResponseKind {
    /// Devices of the queried identity
    DeviceDiscovery {
        /// Identity whose devices are listed
        identity: CryptoIdentity,
        /// Current devices
        device_uids: Vec<DeviceUid>,
    },
    /// Blob stored
    PutUserData {
        /// Storage label
        label: Uid,
    },
    /// Blob fetched, `None` if the label is unknown
    GetUserData {
        /// Stored payload
        data: Option<Vec<u8>>,
    },
    /// Group blob creation result
    CreateGroupBlob {
        /// False if the group already had a blob
        created: bool,
    },
    /// Group blob fetch result
    GetGroupBlob {
        /// Stored blob, `None` if deleted or never created
        encoded_blob: Option<Vec<u8>>,
    },
    /// Group blob update result
    UpdateGroupBlob {
        /// False if the lock nonce did not match
        accepted: bool,
    },
    /// Group blob lock result
    RequestGroupBlobLock {
        /// True if the caller now holds the lock
        granted: bool,
    },
    /// Group blob deleted
    DeleteGroupBlob,
    /// The caller's own devices
    OwnedDeviceDiscovery {
        /// Current devices
        device_uids: Vec<DeviceUid>,
    },
    /// Device renamed
    SetOwnedDeviceName,
    /// Device deactivated
    DeactivateOwnedDevice,
    /// Transfer session opened
    TransferSource {
        /// Session number to display
        session_number: u64,
    },
    /// Transfer session joined
    TransferDestination {
        /// Connection handle for relaying
        connection_identifier: String,
    },
    /// Payload relayed
    TransferRelay,
    /// Next payload of a transfer session
    TransferWait {
        /// Relayed payload
        payload: Vec<u8>,
    },
    /// The server could not process the query
    Failed {
        /// Human-readable reason
        reason: String,
    },
}

/// A response as delivered back into the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResponse {
    /// Identity the original query was made on behalf of
    pub owned_identity: CryptoIdentity,
    /// Protocol instance the response is routed to
    pub origin: ProtocolOrigin,
    /// Context blob copied from the query
    pub context: Vec<u8>,
    /// The answer
    pub result: ServerResponseKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_echoes_origin_and_context() {
        let query = ServerQuery {
            owned_identity: CryptoIdentity::new("https://server.example", [1; 32]),
            origin: ProtocolOrigin {
                protocol_id: ProtocolId::IdentityDetailsPublication,
                instance_uid: Uid::from_bytes([2; 32]),
            },
            kind: ServerQueryKind::PutUserData { label: Uid::from_bytes([3; 32]), data: vec![9] },
            context: vec![4, 5, 6],
        };

        let response =
            query.respond(ServerResponseKind::PutUserData { label: Uid::from_bytes([3; 32]) });
        assert_eq!(response.origin, query.origin);
        assert_eq!(response.context, query.context);
        assert_eq!(response.owned_identity, query.owned_identity);
    }
}
