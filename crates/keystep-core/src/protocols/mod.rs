//! Concrete protocols and the dispatch from [`ProtocolId`] to them.

pub mod channel_creation;
pub mod device_discovery;
pub mod identity_publication;

use keystep_proto::{ProtocolId, encoding};

pub use channel_creation::ChannelCreationWithContactDevice;
pub use device_discovery::DeviceDiscovery;
pub use identity_publication::IdentityDetailsPublication;

use crate::{
    channel::{ChannelManager, ReceivedMessage},
    env::Environment,
    protocol::{
        ProtocolDefinition, ProtocolState,
        executor::{Verdict, run_protocol},
    },
    storage::InstanceKey,
    transaction::UnitOfWork,
};

/// Run the step of whichever protocol `key` names.
pub(crate) fn dispatch<E: Environment>(
    key: &InstanceKey,
    current: Option<&[u8]>,
    message: &ReceivedMessage,
    channels: &ChannelManager<E>,
    uow: &mut UnitOfWork,
) -> Verdict {
    match key.protocol_id {
        ProtocolId::IdentityDetailsPublication => {
            run_protocol::<IdentityDetailsPublication, E>(key, current, message, channels, uow)
        },
        ProtocolId::DeviceDiscovery => {
            run_protocol::<DeviceDiscovery, E>(key, current, message, channels, uow)
        },
        ProtocolId::ChannelCreationWithContactDevice => {
            run_protocol::<ChannelCreationWithContactDevice, E>(key, current, message, channels, uow)
        },
    }
}

/// Debug rendering of a stored state's kind.
pub(crate) fn describe_state(protocol_id: ProtocolId, encoded: &[u8]) -> Option<String> {
    fn kind_of<P: ProtocolDefinition>(encoded: &[u8]) -> Option<String> {
        encoding::decode::<P::State>(encoded).ok().map(|state| format!("{:?}", state.kind()))
    }

    match protocol_id {
        ProtocolId::IdentityDetailsPublication => kind_of::<IdentityDetailsPublication>(encoded),
        ProtocolId::DeviceDiscovery => kind_of::<DeviceDiscovery>(encoded),
        ProtocolId::ChannelCreationWithContactDevice => {
            kind_of::<ChannelCreationWithContactDevice>(encoded)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::device_discovery::DiscoveryState;

    #[test]
    fn describe_state_renders_kind() {
        let contact = keystep_proto::CryptoIdentity::new("https://server.example", [7; 32]);
        let encoded =
            encoding::encode(&DiscoveryState::WaitingForServerResponse { contact }).unwrap();

        assert_eq!(
            describe_state(ProtocolId::DeviceDiscovery, &encoded).as_deref(),
            Some("WaitingForServerResponse")
        );
        assert_eq!(describe_state(ProtocolId::ChannelCreationWithContactDevice, &[0xFF]), None);
    }
}
