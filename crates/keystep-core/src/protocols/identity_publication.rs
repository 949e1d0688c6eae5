//! Identity details publication.
//!
//! The owner starts an instance per published version. If the version
//! carries a photo that was never uploaded, the photo is sealed under a fresh
//! key and uploaded first; the server's answer resumes the instance. The
//! details are then sent to each contact separately over every confirmed
//! oblivious channel with that contact, so no recipient learns who else got
//! them.
//!
//! ```text
//! owner:    Initial ──StartPhotoUpload──► UploadingPhoto ──SendDetails──► DetailsSent
//!              │                                │
//!              └──────(no photo to upload)──────┴──► DetailsSent
//! contact:  Initial ──ProcessDetails──► DetailsReceived
//! ```
//!
//! Every step re-reads the owner's current version. A step triggered for a
//! version that has since been superseded cancels the instance instead.

use keystep_crypto::{AuthenticatedEncryptionKey, aead};
use keystep_proto::{CryptoIdentity, ProtocolId, ServerResponse, ServerResponseKind, Uid, encoding};
use serde::{Deserialize, Serialize};

use crate::{
    assert_unique_steps,
    channel::{ChannelExpectation, ReceptionChannelInfo, SendChannelType, ServerQueryIntent},
    delegate::ContactDetails,
    env::Environment,
    error::StepError,
    protocol::{
        ProtocolDefinition, ProtocolMessageBody, ProtocolState, StepDescriptor, StepTable,
        step::StepContext,
    },
};

/// Publishes owned identity details to every contact.
#[derive(Debug, Clone, Copy)]
pub struct IdentityDetailsPublication;

/// Instance state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicationState {
    /// No step has run
    Initial,
    /// Waiting for the server to store the sealed photo
    UploadingPhoto {
        /// Version being published
        version: u64,
        /// Label the photo was uploaded under
        label: Uid,
        /// Key the photo was sealed with
        key: [u8; 32],
    },
    /// Details were handed to every contact channel
    DetailsSent {
        /// Version published
        version: u64,
    },
    /// A contact's details were stored
    DetailsReceived {
        /// Version received
        version: u64,
    },
    /// Superseded or rejected
    Cancelled,
}

/// Kind of [`PublicationState`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationStateKind {
    Initial,
    UploadingPhoto,
    DetailsSent,
    DetailsReceived,
    Cancelled,
}

impl ProtocolState for PublicationState {
    type Kind = PublicationStateKind;

    fn kind(&self) -> PublicationStateKind {
        match self {
            Self::Initial => PublicationStateKind::Initial,
            Self::UploadingPhoto { .. } => PublicationStateKind::UploadingPhoto,
            Self::DetailsSent { .. } => PublicationStateKind::DetailsSent,
            Self::DetailsReceived { .. } => PublicationStateKind::DetailsReceived,
            Self::Cancelled => PublicationStateKind::Cancelled,
        }
    }

    fn initial() -> Self {
        Self::Initial
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::DetailsSent { .. } | Self::DetailsReceived { .. } | Self::Cancelled)
    }
}

/// Messages of the publication protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicationMessage {
    /// Local trigger: publish `version`
    Initial {
        /// Version to publish
        version: u64,
    },
    /// Server stored the photo
    ServerPutPhoto {
        /// Version the upload was started for
        version: u64,
        /// Label the server stored it under
        label: Uid,
    },
    /// Server refused the photo
    PhotoUploadFailed {
        /// Version the upload was started for
        version: u64,
    },
    /// Details sent by a contact
    Details {
        /// The contact's details
        details: ContactDetails,
    },
}

/// Kind of [`PublicationMessage`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationMessageKind {
    Initial,
    ServerPutPhoto,
    PhotoUploadFailed,
    Details,
}

/// Echoed back by the server with the upload result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PhotoUploadContext {
    version: u64,
}

impl ProtocolMessageBody for PublicationMessage {
    type Kind = PublicationMessageKind;

    fn kind(&self) -> PublicationMessageKind {
        match self {
            Self::Initial { .. } => PublicationMessageKind::Initial,
            Self::ServerPutPhoto { .. } => PublicationMessageKind::ServerPutPhoto,
            Self::PhotoUploadFailed { .. } => PublicationMessageKind::PhotoUploadFailed,
            Self::Details { .. } => PublicationMessageKind::Details,
        }
    }

    fn from_server_response(response: &ServerResponse) -> Option<Self> {
        let PhotoUploadContext { version } = encoding::decode(&response.context).ok()?;
        match &response.result {
            ServerResponseKind::PutUserData { label } => {
                Some(Self::ServerPutPhoto { version, label: *label })
            },
            ServerResponseKind::Failed { .. } => Some(Self::PhotoUploadFailed { version }),
            _ => None,
        }
    }
}

/// Steps of the publication protocol.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationStep {
    StartPhotoUpload,
    SendDetails,
    AbandonPhotoUpload,
    ProcessDetails,
}

impl PublicationStep {
    const fn name(self) -> &'static str {
        match self {
            Self::StartPhotoUpload => "StartPhotoUpload",
            Self::SendDetails => "SendDetails",
            Self::AbandonPhotoUpload => "AbandonPhotoUpload",
            Self::ProcessDetails => "ProcessDetails",
        }
    }
}

const STEPS: StepTable<IdentityDetailsPublication> = &[
    StepDescriptor {
        id: PublicationStep::StartPhotoUpload,
        state: PublicationStateKind::Initial,
        message: PublicationMessageKind::Initial,
        expectation: ChannelExpectation::Local,
    },
    StepDescriptor {
        id: PublicationStep::SendDetails,
        state: PublicationStateKind::UploadingPhoto,
        message: PublicationMessageKind::ServerPutPhoto,
        expectation: ChannelExpectation::Local,
    },
    StepDescriptor {
        id: PublicationStep::AbandonPhotoUpload,
        state: PublicationStateKind::UploadingPhoto,
        message: PublicationMessageKind::PhotoUploadFailed,
        expectation: ChannelExpectation::Local,
    },
    StepDescriptor {
        id: PublicationStep::ProcessDetails,
        state: PublicationStateKind::Initial,
        message: PublicationMessageKind::Details,
        expectation: ChannelExpectation::AnyObliviousChannel,
    },
];

assert_unique_steps!(STEPS);

impl ProtocolDefinition for IdentityDetailsPublication {
    const ID: ProtocolId = ProtocolId::IdentityDetailsPublication;
    const STEPS: StepTable<Self> = STEPS;

    type State = PublicationState;
    type Message = PublicationMessage;
    type StepId = PublicationStep;

    fn execute<E: Environment>(
        step: PublicationStep,
        state: PublicationState,
        message: PublicationMessage,
        ctx: &mut StepContext<'_, E>,
    ) -> Result<Option<PublicationState>, StepError> {
        match (step, state, message) {
            (
                PublicationStep::StartPhotoUpload,
                PublicationState::Initial,
                PublicationMessage::Initial { version },
            ) => start_photo_upload(ctx, version),
            (
                PublicationStep::SendDetails,
                PublicationState::UploadingPhoto { version, label, key },
                PublicationMessage::ServerPutPhoto { version: uploaded_version, label: uploaded_label },
            ) => {
                if uploaded_version != version || uploaded_label != label {
                    tracing::info!(
                        version,
                        uploaded_version,
                        "photo upload does not belong to this instance"
                    );
                    return Ok(Some(PublicationState::Cancelled));
                }
                send_details(ctx, version, label, key)
            },
            (
                PublicationStep::AbandonPhotoUpload,
                PublicationState::UploadingPhoto { version, .. },
                PublicationMessage::PhotoUploadFailed { .. },
            ) => {
                tracing::warn!(version, "photo upload failed, publication cancelled");
                Ok(Some(PublicationState::Cancelled))
            },
            (
                PublicationStep::ProcessDetails,
                PublicationState::Initial,
                PublicationMessage::Details { details },
            ) => process_details(ctx, details),
            (step, _, _) => Err(StepError::StepTableMismatch { step: step.name() }),
        }
    }
}

fn start_photo_upload<E: Environment>(
    ctx: &mut StepContext<'_, E>,
    version: u64,
) -> Result<Option<PublicationState>, StepError> {
    let owned = ctx.owned_identity().clone();
    let published = ctx.identity().published_details(&owned)?;
    if published.version != version {
        tracing::info!(version, current = published.version, "publication superseded");
        return Ok(Some(PublicationState::Cancelled));
    }

    let photo = match (&published.photo, published.photo_server_label) {
        (Some(photo), None) => photo,
        _ => {
            fan_out(ctx, &owned, &ContactDetails::from(&published))?;
            return Ok(Some(PublicationState::DetailsSent { version }));
        },
    };

    let env = ctx.env();
    let key: [u8; 32] = env.random_array();
    let sealed = aead::seal(&AuthenticatedEncryptionKey::from_bytes(key), photo, env.random_array());
    let label = env.random_uid();
    let context = encoding::encode(&PhotoUploadContext { version })?;

    ctx.post_server_query(ServerQueryIntent::PutUserData { label, data: sealed }, context)?;
    tracing::debug!(version, label = ?label, "uploading photo");
    Ok(Some(PublicationState::UploadingPhoto { version, label, key }))
}

fn send_details<E: Environment>(
    ctx: &mut StepContext<'_, E>,
    version: u64,
    label: Uid,
    key: [u8; 32],
) -> Result<Option<PublicationState>, StepError> {
    let owned = ctx.owned_identity().clone();
    let published = ctx.identity().published_details(&owned)?;
    if published.version != version {
        tracing::info!(version, current = published.version, "publication superseded");
        return Ok(Some(PublicationState::Cancelled));
    }

    let identity = ctx.identity();
    identity.set_photo_server_label(ctx.uow(), &owned, version, label, key)?;

    let details = ContactDetails {
        photo_server_label: Some(label),
        photo_key: Some(key),
        ..ContactDetails::from(&published)
    };
    fan_out(ctx, &owned, &details)?;
    Ok(Some(PublicationState::DetailsSent { version }))
}

fn process_details<E: Environment>(
    ctx: &mut StepContext<'_, E>,
    details: ContactDetails,
) -> Result<Option<PublicationState>, StepError> {
    let ReceptionChannelInfo::ObliviousChannel { remote_identity, .. } = ctx.reception() else {
        return Err(StepError::StepTableMismatch { step: PublicationStep::ProcessDetails.name() });
    };
    let contact = remote_identity.clone();
    let owned = ctx.owned_identity().clone();
    let identity = ctx.identity();

    if !identity.is_contact(&owned, &contact)? {
        tracing::info!(sender = %contact, "details from a non-contact");
        return Ok(Some(PublicationState::Cancelled));
    }

    let version = details.version;
    if identity.contact_published_version(&owned, &contact)?.is_some_and(|known| known >= version) {
        tracing::info!(sender = %contact, version, "details not newer than known version");
        return Ok(Some(PublicationState::Cancelled));
    }

    identity.update_contact_published_details(ctx.uow(), &owned, &contact, details)?;
    Ok(Some(PublicationState::DetailsReceived { version }))
}

/// One post per contact. Returns how many envelopes were staged.
///
/// A contact that cannot be reached is logged and skipped.
fn fan_out<E: Environment>(
    ctx: &mut StepContext<'_, E>,
    owned: &CryptoIdentity,
    details: &ContactDetails,
) -> Result<usize, StepError> {
    let contacts = ctx.identity().contacts(owned)?;
    let message = PublicationMessage::Details { details: details.clone() };

    let mut staged = 0;
    for contact in contacts {
        let channel = SendChannelType::AllObliviousChannelsWithContact { contact: contact.clone() };
        match ctx.post(channel, &message) {
            Ok(ids) if ids.is_empty() => {
                tracing::debug!(contact = %contact, "no confirmed channel with contact");
            },
            Ok(ids) => staged += ids.len(),
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => tracing::warn!(contact = %contact, error = %err, "could not post details"),
        }
    }

    tracing::info!(version = details.version, staged, "details fanned out");
    Ok(staged)
}
