//! Oblivious channel creation with one contact device.
//!
//! Runs over the asymmetric channel. Each side generates an ephemeral key
//! pair and contributes one half of the channel seed, wrapped to the other
//! side's ephemeral public key:
//!
//! ```text
//! initiator                                   responder
//!   SendPing      ── Ping(eph_i) ──────────►    ProcessPing
//!   ProcessAck    ◄── Ack(eph_r, wrap(k2)) ──
//!   (channel up)  ── Confirmation(wrap(k1)) ─►  ProcessConfirmation (channel up)
//!
//! seed = derive_channel_seed(k1, k2)
//! ```
//!
//! Both ends hand the seed to the oblivious channel collaborator, which owns
//! the ratchet from then on.

use keystep_crypto::{
    AuthenticatedEncryptionKey, EncryptionKeyPair, PrivateKeyForEncryption,
    PublicKeyForEncryption, kdf,
    wrap::{self, KEYPAIR_RANDOMNESS_SIZE, WRAP_RANDOMNESS_SIZE},
};
use keystep_proto::{CryptoIdentity, DeviceUid, ProtocolId};
use serde::{Deserialize, Serialize};

use crate::{
    assert_unique_steps,
    channel::{ChannelExpectation, SendChannelType},
    env::Environment,
    error::StepError,
    protocol::{
        ProtocolDefinition, ProtocolMessageBody, ProtocolState, StepDescriptor, StepTable,
        step::StepContext,
    },
};

/// Establishes an oblivious channel with one contact device.
#[derive(Debug, Clone, Copy)]
pub struct ChannelCreationWithContactDevice;

/// Instance state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelCreationState {
    /// No step has run
    Initial,
    /// Initiator sent its ping
    WaitingForAck {
        /// Remote identity
        contact: CryptoIdentity,
        /// Remote device
        contact_device: DeviceUid,
        /// Initiator's ephemeral private key
        ephemeral_private: [u8; 32],
    },
    /// Responder sent its half of the seed
    WaitingForConfirmation {
        /// Remote identity
        contact: CryptoIdentity,
        /// Remote device
        contact_device: DeviceUid,
        /// Responder's ephemeral private key
        ephemeral_private: [u8; 32],
        /// Responder's seed half
        k2: [u8; 32],
    },
    /// Channel handed to the collaborator
    ChannelConfirmed {
        /// Remote identity
        contact: CryptoIdentity,
        /// Remote device
        contact_device: DeviceUid,
    },
    /// Rejected or failed
    Cancelled,
}

/// Kind of [`ChannelCreationState`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCreationStateKind {
    Initial,
    WaitingForAck,
    WaitingForConfirmation,
    ChannelConfirmed,
    Cancelled,
}

impl ProtocolState for ChannelCreationState {
    type Kind = ChannelCreationStateKind;

    fn kind(&self) -> ChannelCreationStateKind {
        match self {
            Self::Initial => ChannelCreationStateKind::Initial,
            Self::WaitingForAck { .. } => ChannelCreationStateKind::WaitingForAck,
            Self::WaitingForConfirmation { .. } => ChannelCreationStateKind::WaitingForConfirmation,
            Self::ChannelConfirmed { .. } => ChannelCreationStateKind::ChannelConfirmed,
            Self::Cancelled => ChannelCreationStateKind::Cancelled,
        }
    }

    fn initial() -> Self {
        Self::Initial
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::ChannelConfirmed { .. } | Self::Cancelled)
    }
}

/// Messages of the channel creation protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelCreationMessage {
    /// Local trigger on the initiator
    Initial {
        /// Remote identity
        contact: CryptoIdentity,
        /// Remote device
        contact_device: DeviceUid,
    },
    /// Initiator to responder
    Ping {
        /// Initiator identity
        initiator: CryptoIdentity,
        /// Initiator device
        initiator_device: DeviceUid,
        /// Initiator's ephemeral public key
        ephemeral_key: [u8; 32],
    },
    /// Responder to initiator
    Ack {
        /// Responder device
        responder_device: DeviceUid,
        /// Responder's ephemeral public key
        ephemeral_key: [u8; 32],
        /// Responder's seed half, wrapped to the initiator's ephemeral key
        wrapped_k2: Vec<u8>,
    },
    /// Initiator to responder
    Confirmation {
        /// Initiator's seed half, wrapped to the responder's ephemeral key
        wrapped_k1: Vec<u8>,
    },
}

/// Kind of [`ChannelCreationMessage`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCreationMessageKind {
    Initial,
    Ping,
    Ack,
    Confirmation,
}

impl ProtocolMessageBody for ChannelCreationMessage {
    type Kind = ChannelCreationMessageKind;

    fn kind(&self) -> ChannelCreationMessageKind {
        match self {
            Self::Initial { .. } => ChannelCreationMessageKind::Initial,
            Self::Ping { .. } => ChannelCreationMessageKind::Ping,
            Self::Ack { .. } => ChannelCreationMessageKind::Ack,
            Self::Confirmation { .. } => ChannelCreationMessageKind::Confirmation,
        }
    }
}

/// Steps of the channel creation protocol.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCreationStep {
    SendPing,
    ProcessPing,
    ProcessAck,
    ProcessConfirmation,
}

impl ChannelCreationStep {
    const fn name(self) -> &'static str {
        match self {
            Self::SendPing => "SendPing",
            Self::ProcessPing => "ProcessPing",
            Self::ProcessAck => "ProcessAck",
            Self::ProcessConfirmation => "ProcessConfirmation",
        }
    }
}

const STEPS: StepTable<ChannelCreationWithContactDevice> = &[
    StepDescriptor {
        id: ChannelCreationStep::SendPing,
        state: ChannelCreationStateKind::Initial,
        message: ChannelCreationMessageKind::Initial,
        expectation: ChannelExpectation::Local,
    },
    StepDescriptor {
        id: ChannelCreationStep::ProcessPing,
        state: ChannelCreationStateKind::Initial,
        message: ChannelCreationMessageKind::Ping,
        expectation: ChannelExpectation::AsymmetricChannel,
    },
    StepDescriptor {
        id: ChannelCreationStep::ProcessAck,
        state: ChannelCreationStateKind::WaitingForAck,
        message: ChannelCreationMessageKind::Ack,
        expectation: ChannelExpectation::AsymmetricChannel,
    },
    StepDescriptor {
        id: ChannelCreationStep::ProcessConfirmation,
        state: ChannelCreationStateKind::WaitingForConfirmation,
        message: ChannelCreationMessageKind::Confirmation,
        expectation: ChannelExpectation::AsymmetricChannel,
    },
];

assert_unique_steps!(STEPS);

impl ProtocolDefinition for ChannelCreationWithContactDevice {
    const ID: ProtocolId = ProtocolId::ChannelCreationWithContactDevice;
    const STEPS: StepTable<Self> = STEPS;

    type State = ChannelCreationState;
    type Message = ChannelCreationMessage;
    type StepId = ChannelCreationStep;

    fn execute<E: Environment>(
        step: ChannelCreationStep,
        state: ChannelCreationState,
        message: ChannelCreationMessage,
        ctx: &mut StepContext<'_, E>,
    ) -> Result<Option<ChannelCreationState>, StepError> {
        match (step, state, message) {
            (
                ChannelCreationStep::SendPing,
                ChannelCreationState::Initial,
                ChannelCreationMessage::Initial { contact, contact_device },
            ) => send_ping(ctx, contact, contact_device),
            (
                ChannelCreationStep::ProcessPing,
                ChannelCreationState::Initial,
                ChannelCreationMessage::Ping { initiator, initiator_device, ephemeral_key },
            ) => process_ping(ctx, initiator, initiator_device, ephemeral_key),
            (
                ChannelCreationStep::ProcessAck,
                ChannelCreationState::WaitingForAck { contact, contact_device, ephemeral_private },
                ChannelCreationMessage::Ack { responder_device, ephemeral_key, wrapped_k2 },
            ) => {
                if responder_device != contact_device {
                    tracing::debug!(
                        expected = %contact_device,
                        got = %responder_device,
                        "ack from another device"
                    );
                    return Ok(None);
                }
                process_ack(ctx, contact, contact_device, ephemeral_private, ephemeral_key, &wrapped_k2)
            },
            (
                ChannelCreationStep::ProcessConfirmation,
                ChannelCreationState::WaitingForConfirmation {
                    contact,
                    contact_device,
                    ephemeral_private,
                    k2,
                },
                ChannelCreationMessage::Confirmation { wrapped_k1 },
            ) => {
                let Some(k1) = unwrap_half(&ephemeral_private, &wrapped_k1) else {
                    return Ok(Some(ChannelCreationState::Cancelled));
                };
                establish(ctx, contact, contact_device, &k1, &k2)
            },
            (step, _, _) => Err(StepError::StepTableMismatch { step: step.name() }),
        }
    }
}

fn send_ping<E: Environment>(
    ctx: &mut StepContext<'_, E>,
    contact: CryptoIdentity,
    contact_device: DeviceUid,
) -> Result<Option<ChannelCreationState>, StepError> {
    let owned = ctx.owned_identity().clone();
    let current_device = ctx.identity().current_device_uid(&owned)?;
    let ephemeral = ephemeral_key_pair(ctx.env());

    let ping = ChannelCreationMessage::Ping {
        initiator: owned,
        initiator_device: current_device,
        ephemeral_key: ephemeral.public_key().to_bytes(),
    };
    let channel =
        SendChannelType::AsymmetricChannel { to: contact.clone(), device_uids: vec![contact_device] };
    ctx.post(channel, &ping)?;

    Ok(Some(ChannelCreationState::WaitingForAck {
        contact,
        contact_device,
        ephemeral_private: ephemeral.private_key().to_bytes(),
    }))
}

fn process_ping<E: Environment>(
    ctx: &mut StepContext<'_, E>,
    initiator: CryptoIdentity,
    initiator_device: DeviceUid,
    initiator_key: [u8; 32],
) -> Result<Option<ChannelCreationState>, StepError> {
    let owned = ctx.owned_identity().clone();
    if !ctx.identity().is_contact(&owned, &initiator)? {
        tracing::info!(initiator = %initiator, "ping from a non-contact");
        return Ok(Some(ChannelCreationState::Cancelled));
    }
    let Ok(initiator_key) = PublicKeyForEncryption::from_bytes(initiator_key) else {
        tracing::warn!(initiator = %initiator, "ping carries an invalid ephemeral key");
        return Ok(Some(ChannelCreationState::Cancelled));
    };

    let env = ctx.env();
    let current_device = ctx.identity().current_device_uid(&owned)?;
    let ephemeral = ephemeral_key_pair(env);
    let k2: [u8; 32] = env.random_array();
    let randomness: [u8; WRAP_RANDOMNESS_SIZE] = env.random_array();
    let wrapped_k2 =
        wrap::wrap_key(&initiator_key, &AuthenticatedEncryptionKey::from_bytes(k2), &randomness)?;

    let ack = ChannelCreationMessage::Ack {
        responder_device: current_device,
        ephemeral_key: ephemeral.public_key().to_bytes(),
        wrapped_k2,
    };
    let channel = SendChannelType::AsymmetricChannel {
        to: initiator.clone(),
        device_uids: vec![initiator_device],
    };
    ctx.post(channel, &ack)?;

    Ok(Some(ChannelCreationState::WaitingForConfirmation {
        contact: initiator,
        contact_device: initiator_device,
        ephemeral_private: ephemeral.private_key().to_bytes(),
        k2,
    }))
}

fn process_ack<E: Environment>(
    ctx: &mut StepContext<'_, E>,
    contact: CryptoIdentity,
    contact_device: DeviceUid,
    ephemeral_private: [u8; 32],
    responder_key: [u8; 32],
    wrapped_k2: &[u8],
) -> Result<Option<ChannelCreationState>, StepError> {
    let Some(k2) = unwrap_half(&ephemeral_private, wrapped_k2) else {
        return Ok(Some(ChannelCreationState::Cancelled));
    };
    let Ok(responder_key) = PublicKeyForEncryption::from_bytes(responder_key) else {
        tracing::warn!(contact = %contact, "ack carries an invalid ephemeral key");
        return Ok(Some(ChannelCreationState::Cancelled));
    };

    let env = ctx.env();
    let k1: [u8; 32] = env.random_array();
    let randomness: [u8; WRAP_RANDOMNESS_SIZE] = env.random_array();
    let wrapped_k1 =
        wrap::wrap_key(&responder_key, &AuthenticatedEncryptionKey::from_bytes(k1), &randomness)?;

    let channel = SendChannelType::AsymmetricChannel {
        to: contact.clone(),
        device_uids: vec![contact_device],
    };
    ctx.post(channel, &ChannelCreationMessage::Confirmation { wrapped_k1 })?;

    establish(ctx, contact, contact_device, &k1, &k2)
}

fn establish<E: Environment>(
    ctx: &mut StepContext<'_, E>,
    contact: CryptoIdentity,
    contact_device: DeviceUid,
    k1: &[u8; 32],
    k2: &[u8; 32],
) -> Result<Option<ChannelCreationState>, StepError> {
    let owned = ctx.owned_identity().clone();
    let seed = kdf::derive_channel_seed(k1, k2);
    let oblivious = ctx.oblivious()?;
    oblivious.create_channel(ctx.uow(), &owned, &contact, contact_device, seed)?;

    tracing::info!(contact = %contact, device = %contact_device, "oblivious channel confirmed");
    Ok(Some(ChannelCreationState::ChannelConfirmed { contact, contact_device }))
}

fn ephemeral_key_pair<E: Environment>(env: &E) -> EncryptionKeyPair {
    EncryptionKeyPair::generate(&env.random_array::<KEYPAIR_RANDOMNESS_SIZE>())
}

/// `None` if the half was not wrapped for our ephemeral key.
fn unwrap_half(ephemeral_private: &[u8; 32], wrapped: &[u8]) -> Option<[u8; 32]> {
    let private_key = match PrivateKeyForEncryption::from_bytes(*ephemeral_private) {
        Ok(key) => key,
        Err(err) => {
            tracing::error!(error = %err, "stored ephemeral key is invalid");
            return None;
        },
    };
    match wrap::unwrap_key(&private_key, wrapped) {
        Ok(key) => Some(*key.as_bytes()),
        Err(err) => {
            tracing::warn!(error = %err, "seed half did not unwrap");
            None
        },
    }
}
