//! Contact device discovery.
//!
//! Asks the server for a contact's current devices, records the ones we did
//! not know, and starts one [`ChannelCreationWithContactDevice`] instance per
//! new device.

use std::collections::BTreeSet;

use keystep_proto::{CryptoIdentity, DeviceUid, ProtocolId, ServerResponse, ServerResponseKind};
use serde::{Deserialize, Serialize};

use super::channel_creation::{ChannelCreationMessage, ChannelCreationWithContactDevice};
use crate::{
    assert_unique_steps,
    channel::{ChannelExpectation, ServerQueryIntent},
    env::Environment,
    error::StepError,
    protocol::{
        ProtocolDefinition, ProtocolMessageBody, ProtocolState, StepDescriptor, StepTable,
        step::StepContext,
    },
};

/// Discovers the devices of one contact.
#[derive(Debug, Clone, Copy)]
pub struct DeviceDiscovery;

/// Instance state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryState {
    /// No step has run
    Initial,
    /// Query posted
    WaitingForServerResponse {
        /// Contact being looked up
        contact: CryptoIdentity,
    },
    /// Devices recorded
    Discovered {
        /// Devices that were new
        count: usize,
    },
    /// Not a contact, or the server failed
    Cancelled,
}

/// Kind of [`DiscoveryState`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStateKind {
    Initial,
    WaitingForServerResponse,
    Discovered,
    Cancelled,
}

impl ProtocolState for DiscoveryState {
    type Kind = DiscoveryStateKind;

    fn kind(&self) -> DiscoveryStateKind {
        match self {
            Self::Initial => DiscoveryStateKind::Initial,
            Self::WaitingForServerResponse { .. } => DiscoveryStateKind::WaitingForServerResponse,
            Self::Discovered { .. } => DiscoveryStateKind::Discovered,
            Self::Cancelled => DiscoveryStateKind::Cancelled,
        }
    }

    fn initial() -> Self {
        Self::Initial
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Discovered { .. } | Self::Cancelled)
    }
}

/// Messages of the discovery protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    /// Local trigger
    Initial {
        /// Contact to look up
        contact: CryptoIdentity,
    },
    /// Server answer
    ServerDeviceUids {
        /// Identity the server answered for
        contact: CryptoIdentity,
        /// Its current devices
        device_uids: Vec<DeviceUid>,
    },
    /// Server could not answer
    DiscoveryFailed,
}

/// Kind of [`DiscoveryMessage`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMessageKind {
    Initial,
    ServerDeviceUids,
    DiscoveryFailed,
}

impl ProtocolMessageBody for DiscoveryMessage {
    type Kind = DiscoveryMessageKind;

    fn kind(&self) -> DiscoveryMessageKind {
        match self {
            Self::Initial { .. } => DiscoveryMessageKind::Initial,
            Self::ServerDeviceUids { .. } => DiscoveryMessageKind::ServerDeviceUids,
            Self::DiscoveryFailed => DiscoveryMessageKind::DiscoveryFailed,
        }
    }

    fn from_server_response(response: &ServerResponse) -> Option<Self> {
        match &response.result {
            ServerResponseKind::DeviceDiscovery { identity, device_uids } => {
                Some(Self::ServerDeviceUids {
                    contact: identity.clone(),
                    device_uids: device_uids.clone(),
                })
            },
            ServerResponseKind::Failed { .. } => Some(Self::DiscoveryFailed),
            _ => None,
        }
    }
}

/// Steps of the discovery protocol.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStep {
    RequestDeviceUids,
    ProcessDeviceUids,
    AbandonDiscovery,
}

impl DiscoveryStep {
    const fn name(self) -> &'static str {
        match self {
            Self::RequestDeviceUids => "RequestDeviceUids",
            Self::ProcessDeviceUids => "ProcessDeviceUids",
            Self::AbandonDiscovery => "AbandonDiscovery",
        }
    }
}

const STEPS: StepTable<DeviceDiscovery> = &[
    StepDescriptor {
        id: DiscoveryStep::RequestDeviceUids,
        state: DiscoveryStateKind::Initial,
        message: DiscoveryMessageKind::Initial,
        expectation: ChannelExpectation::Local,
    },
    StepDescriptor {
        id: DiscoveryStep::ProcessDeviceUids,
        state: DiscoveryStateKind::WaitingForServerResponse,
        message: DiscoveryMessageKind::ServerDeviceUids,
        expectation: ChannelExpectation::Local,
    },
    StepDescriptor {
        id: DiscoveryStep::AbandonDiscovery,
        state: DiscoveryStateKind::WaitingForServerResponse,
        message: DiscoveryMessageKind::DiscoveryFailed,
        expectation: ChannelExpectation::Local,
    },
];

assert_unique_steps!(STEPS);

impl ProtocolDefinition for DeviceDiscovery {
    const ID: ProtocolId = ProtocolId::DeviceDiscovery;
    const STEPS: StepTable<Self> = STEPS;

    type State = DiscoveryState;
    type Message = DiscoveryMessage;
    type StepId = DiscoveryStep;

    fn execute<E: Environment>(
        step: DiscoveryStep,
        state: DiscoveryState,
        message: DiscoveryMessage,
        ctx: &mut StepContext<'_, E>,
    ) -> Result<Option<DiscoveryState>, StepError> {
        match (step, state, message) {
            (
                DiscoveryStep::RequestDeviceUids,
                DiscoveryState::Initial,
                DiscoveryMessage::Initial { contact },
            ) => {
                let owned = ctx.owned_identity().clone();
                if !ctx.identity().is_contact(&owned, &contact)? {
                    tracing::info!(contact = %contact, "not a contact, discovery cancelled");
                    return Ok(Some(DiscoveryState::Cancelled));
                }
                ctx.post_server_query(
                    ServerQueryIntent::DeviceDiscovery { identity: contact.clone() },
                    Vec::new(),
                )?;
                Ok(Some(DiscoveryState::WaitingForServerResponse { contact }))
            },
            (
                DiscoveryStep::ProcessDeviceUids,
                DiscoveryState::WaitingForServerResponse { contact },
                DiscoveryMessage::ServerDeviceUids { contact: answered, device_uids },
            ) => {
                if answered != contact {
                    tracing::warn!(asked = %contact, answered = %answered, "server answered for another identity");
                    return Ok(Some(DiscoveryState::Cancelled));
                }
                process_device_uids(ctx, &contact, device_uids)
            },
            (
                DiscoveryStep::AbandonDiscovery,
                DiscoveryState::WaitingForServerResponse { contact },
                DiscoveryMessage::DiscoveryFailed,
            ) => {
                tracing::warn!(contact = %contact, "device discovery failed");
                Ok(Some(DiscoveryState::Cancelled))
            },
            (step, _, _) => Err(StepError::StepTableMismatch { step: step.name() }),
        }
    }
}

fn process_device_uids<E: Environment>(
    ctx: &mut StepContext<'_, E>,
    contact: &CryptoIdentity,
    device_uids: Vec<DeviceUid>,
) -> Result<Option<DiscoveryState>, StepError> {
    let owned = ctx.owned_identity().clone();
    let identity = ctx.identity();

    let mut count = 0;
    for device in device_uids.into_iter().collect::<BTreeSet<_>>() {
        if !identity.add_contact_device(ctx.uow(), &owned, contact, device)? {
            continue;
        }
        let child = ctx.spawn_child::<ChannelCreationWithContactDevice>(
            &ChannelCreationMessage::Initial { contact: contact.clone(), contact_device: device },
        )?;
        tracing::debug!(contact = %contact, device = %device, child = ?child, "new contact device");
        count += 1;
    }

    tracing::info!(contact = %contact, count, "contact devices discovered");
    Ok(Some(DiscoveryState::Discovered { count }))
}

#[cfg(test)]
mod tests {
    use keystep_proto::{ProtocolOrigin, Uid};

    use super::*;

    fn contact() -> CryptoIdentity {
        CryptoIdentity::new("https://server.example", [5; 32])
    }

    #[test]
    fn discovery_response_becomes_device_list() {
        let devices = vec![DeviceUid(Uid::from_bytes([1; 32]))];
        let response = ServerResponse {
            owned_identity: CryptoIdentity::new("https://server.example", [6; 32]),
            origin: ProtocolOrigin {
                protocol_id: ProtocolId::DeviceDiscovery,
                instance_uid: Uid::from_bytes([2; 32]),
            },
            context: Vec::new(),
            result: ServerResponseKind::DeviceDiscovery {
                identity: contact(),
                device_uids: devices.clone(),
            },
        };

        assert_eq!(
            DiscoveryMessage::from_server_response(&response),
            Some(DiscoveryMessage::ServerDeviceUids { contact: contact(), device_uids: devices })
        );
    }

    #[test]
    fn server_answer_needs_a_waiting_instance() {
        let answer =
            DiscoveryMessage::ServerDeviceUids { contact: contact(), device_uids: Vec::new() };
        assert!(DeviceDiscovery::find_step(&DiscoveryState::Initial, &answer).is_none());

        let waiting = DiscoveryState::WaitingForServerResponse { contact: contact() };
        let row = DeviceDiscovery::find_step(&waiting, &answer).unwrap();
        assert_eq!(row.id, DiscoveryStep::ProcessDeviceUids);
    }
}
