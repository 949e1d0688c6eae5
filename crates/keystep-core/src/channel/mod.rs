//! Channel layer.
//!
//! Decides how a message's key is wrapped and how the result travels. A
//! protocol step describes where a message should go with a
//! [`SendChannelType`]; the layer resolves it into concrete [`Channel`]s,
//! one per recipient device, encrypts the content once and wraps the
//! content key once per channel.
//!
//! # Channels
//!
//! | channel              | key wrapping                    | payloads          |
//! |----------------------|---------------------------------|-------------------|
//! | `Local`              | none, loopback                  | protocol          |
//! | `AsymmetricChannel`  | recipient's long-term key       | protocol          |
//! | `ObliviousChannel`   | confirmed device channel        | protocol, app     |
//! | `ServerQuery`        | none, handed to fetch delegate  | server query      |
//!
//! Channels are values built per post and never retained. Key material that
//! outlives a post belongs to the collaborators.

mod posting;
mod receiving;
mod server;

use keystep_proto::{CryptoIdentity, DeviceUid, MessageId, ProtocolMessage, ServerResponse};
use serde::{Deserialize, Serialize};

pub use posting::{ChannelManager, acceptable_channels_for_posting};
pub use receiving::{OpenedEnvelope, UnwrapOutcome};
pub use server::{ServerQueryIntent, post_server_query};

/// Wrapped keys start with one of these tags.
pub(crate) mod wrap_tag {
    /// Wrapped with the recipient identity's public key
    pub const ASYMMETRIC: u8 = 0x01;
    /// Wrapped by the oblivious channel collaborator
    pub const OBLIVIOUS: u8 = 0x02;
}

/// Where a step wants a message to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendChannelType {
    /// Back into this engine, same identity
    Local,
    /// Confirmed channels with the listed devices of `to`
    ObliviousChannel {
        /// Remote identity
        to: CryptoIdentity,
        /// Devices to reach; those without a confirmed channel are skipped
        device_uids: Vec<DeviceUid>,
    },
    /// Every confirmed channel with a contact
    AllObliviousChannelsWithContact {
        /// Remote identity
        contact: CryptoIdentity,
    },
    /// Every confirmed channel with the owned identity's other devices
    AllOwnedDevices,
    /// One asymmetric message per listed device of `to`
    AsymmetricChannel {
        /// Remote identity
        to: CryptoIdentity,
        /// Devices to reach
        device_uids: Vec<DeviceUid>,
    },
    /// One asymmetric message for every device of `to`
    AsymmetricChannelBroadcast {
        /// Remote identity
        to: CryptoIdentity,
    },
    /// The fetch collaborator
    ServerQuery,
}

impl SendChannelType {
    fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::ObliviousChannel { .. }
            | Self::AllObliviousChannelsWithContact { .. }
            | Self::AllOwnedDevices => "oblivious",
            Self::AsymmetricChannel { .. } | Self::AsymmetricChannelBroadcast { .. } => {
                "asymmetric"
            },
            Self::ServerQuery => "server",
        }
    }
}

/// A resolved channel to one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    /// Loopback
    Local,
    /// Public-key wrap for one device
    AsymmetricChannel {
        /// Remote identity
        to: CryptoIdentity,
        /// Remote device
        device: DeviceUid,
    },
    /// Public-key wrap for every device of `to`
    AsymmetricChannelBroadcast {
        /// Remote identity
        to: CryptoIdentity,
    },
    /// Confirmed channel with one device
    ObliviousChannel {
        /// Remote identity
        to: CryptoIdentity,
        /// Remote device
        device: DeviceUid,
    },
    /// Fetch collaborator
    ServerQuery,
}

/// How a received message reached us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceptionChannelInfo {
    /// Posted by this engine, or a server response
    Local,
    /// Through a confirmed channel, which authenticates the sender
    ObliviousChannel {
        /// Authenticated sender identity
        remote_identity: CryptoIdentity,
        /// Authenticated sender device
        remote_device: DeviceUid,
    },
    /// Wrapped with our public key; the sender is not authenticated
    AsymmetricChannel,
}

/// The reception a step is willing to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelExpectation {
    /// Only messages this engine produced
    Local,
    /// Any confirmed channel
    AnyObliviousChannel,
    /// A confirmed channel with another device of the owned identity
    AnyObliviousChannelWithOwnedDevice,
    /// An asymmetric channel
    AsymmetricChannel,
}

impl ChannelExpectation {
    /// True if a message received through `info` satisfies this expectation.
    pub fn accepts(self, info: &ReceptionChannelInfo, owned: &CryptoIdentity) -> bool {
        match (self, info) {
            (Self::Local, ReceptionChannelInfo::Local)
            | (Self::AnyObliviousChannel, ReceptionChannelInfo::ObliviousChannel { .. })
            | (Self::AsymmetricChannel, ReceptionChannelInfo::AsymmetricChannel) => true,
            (
                Self::AnyObliviousChannelWithOwnedDevice,
                ReceptionChannelInfo::ObliviousChannel { remote_identity, .. },
            ) => remote_identity == owned,
            _ => false,
        }
    }
}

/// What a received message carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceivedPayload {
    /// A protocol message from a peer or from this engine
    Protocol(ProtocolMessage),
    /// The answer to a server query
    ServerResponse(ServerResponse),
}

/// A message ready for the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    /// Identifies the message for idempotent processing
    pub message_id: MessageId,
    /// How it arrived
    pub reception: ReceptionChannelInfo,
    /// What it carries
    pub payload: ReceivedPayload,
}

/// What a step posts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingPayload {
    /// A message for a protocol instance
    Protocol(ProtocolMessage),
    /// Application content, not interpreted by the engine
    Application(Vec<u8>),
    /// A server query
    ServerQuery {
        /// Instance that receives the response
        origin: keystep_proto::ProtocolOrigin,
        /// The request
        intent: ServerQueryIntent,
        /// Bytes echoed back on the response
        context: Vec<u8>,
    },
}

impl OutgoingPayload {
    fn name(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::Application(_) => "application",
            Self::ServerQuery { .. } => "server query",
        }
    }
}

/// A message with its destination policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Identity posting the message
    pub owned_identity: CryptoIdentity,
    /// Destination policy
    pub channel: SendChannelType,
    /// Content
    pub payload: OutgoingPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned() -> CryptoIdentity {
        CryptoIdentity::new("https://server.example", [1; 32])
    }

    fn oblivious_from(remote: CryptoIdentity) -> ReceptionChannelInfo {
        ReceptionChannelInfo::ObliviousChannel {
            remote_identity: remote,
            remote_device: DeviceUid(keystep_proto::Uid::from_bytes([9; 32])),
        }
    }

    #[test]
    fn local_expectation_rejects_remote_channels() {
        let expectation = ChannelExpectation::Local;
        assert!(expectation.accepts(&ReceptionChannelInfo::Local, &owned()));
        assert!(!expectation.accepts(&ReceptionChannelInfo::AsymmetricChannel, &owned()));
        assert!(!expectation.accepts(&oblivious_from(owned()), &owned()));
    }

    #[test]
    fn owned_device_expectation_checks_sender() {
        let contact = CryptoIdentity::new("https://server.example", [2; 32]);
        let expectation = ChannelExpectation::AnyObliviousChannelWithOwnedDevice;

        assert!(expectation.accepts(&oblivious_from(owned()), &owned()));
        assert!(!expectation.accepts(&oblivious_from(contact.clone()), &owned()));
        assert!(ChannelExpectation::AnyObliviousChannel.accepts(&oblivious_from(contact), &owned()));
    }

    #[test]
    fn asymmetric_expectation_rejects_local() {
        let expectation = ChannelExpectation::AsymmetricChannel;
        assert!(expectation.accepts(&ReceptionChannelInfo::AsymmetricChannel, &owned()));
        assert!(!expectation.accepts(&ReceptionChannelInfo::Local, &owned()));
    }
}
