//! Protocol messages and transport envelopes

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    errors::{ProtocolError, Result},
    identity::CryptoIdentity,
    uid::{DeviceUid, Uid},
};

/// Protocols known to the engine.
///
/// Wire values are stable; new protocols take new numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolId {
    /// Publish owned identity details to every contact
    IdentityDetailsPublication,
    /// Ask the server which devices a contact has
    DeviceDiscovery,
    /// Establish an oblivious channel with one contact device
    ChannelCreationWithContactDevice,
}

impl ProtocolId {
    /// All protocols, in wire order.
    pub const ALL: [Self; 3] =
        [Self::IdentityDetailsPublication, Self::DeviceDiscovery, Self::ChannelCreationWithContactDevice];

    /// Stable wire value.
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::IdentityDetailsPublication => 1,
            Self::DeviceDiscovery => 2,
            Self::ChannelCreationWithContactDevice => 3,
        }
    }

    /// Parse a wire value.
    pub const fn from_u16(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::IdentityDetailsPublication),
            2 => Ok(Self::DeviceDiscovery),
            3 => Ok(Self::ChannelCreationWithContactDevice),
            other => Err(ProtocolError::UnknownProtocol(other)),
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identifies a message from the point of view of one owned identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    /// Owned identity that sent or received the message
    pub owned_identity: CryptoIdentity,
    /// Random per-message identifier
    pub uid: Uid,
}

/// A message addressed to one protocol instance.
///
/// `body` is the CBOR encoding of the protocol's own message enum; the
/// engine only routes on `protocol_id` and `instance_uid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Protocol the message belongs to
    pub protocol_id: ProtocolId,
    /// Instance the message belongs to
    pub instance_uid: Uid,
    /// Encoded protocol-specific message
    pub body: Vec<u8>,
}

/// The cleartext carried inside an encrypted envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// Routed to the protocol executor
    Protocol(ProtocolMessage),
    /// Opaque application payload, handed back to the caller
    Application(Vec<u8>),
}

/// A transport-ready encrypted message.
///
/// The content key is wrapped separately so that the same ciphertext can be
/// fanned out to several channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Per-message identifier, shared by sender and recipient
    pub message_uid: Uid,
    /// Recipient identity
    pub to_identity: CryptoIdentity,
    /// Recipient devices; empty means every device of the identity
    pub to_devices: Vec<DeviceUid>,
    /// Content key, wrapped for the channel the envelope travels on
    pub wrapped_key: Vec<u8>,
    /// `ChannelMessage` sealed under the content key
    pub encrypted_content: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_wire_values_are_stable() {
        for id in ProtocolId::ALL {
            assert_eq!(ProtocolId::from_u16(id.to_u16()).unwrap(), id);
        }
        assert_eq!(ProtocolId::from_u16(0), Err(ProtocolError::UnknownProtocol(0)));
    }
}
