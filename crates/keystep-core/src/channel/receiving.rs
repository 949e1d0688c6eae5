//! Inbound path: unwrap the content key, decrypt, decode.

use keystep_crypto::{AuthenticatedEncryptionKey, aead, wrap};
use keystep_proto::{ChannelMessage, CryptoIdentity, Envelope, MessageId, encoding};

use super::{ChannelManager, ReceivedMessage, ReceivedPayload, ReceptionChannelInfo, wrap_tag};
use crate::{delegate::Collaborators, env::Environment, error::ChannelError};

/// Result of trying to unwrap a message key.
#[derive(Debug)]
pub enum UnwrapOutcome {
    /// The key and the channel that delivered it
    Unwrapped {
        /// Content key
        key: AuthenticatedEncryptionKey,
        /// Reception info to hand to the executor
        channel_info: ReceptionChannelInfo,
    },
    /// Not for us, or corrupt
    CouldNotUnwrap,
}

/// An opened envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenedEnvelope {
    /// A protocol message for the executor
    Protocol(ReceivedMessage),
    /// Application content, handed back to the caller
    Application {
        /// Message identifier
        message_id: MessageId,
        /// How it arrived
        reception: ReceptionChannelInfo,
        /// Decrypted content
        content: Vec<u8>,
    },
    /// The key or content could not be recovered
    Undecryptable {
        /// Message identifier
        message_id: MessageId,
    },
}

impl<E: Environment> ChannelManager<E> {
    /// Unwrap a message key addressed to `owned`.
    ///
    /// Wrong keys, corrupt bytes and identities we do not own yield
    /// `CouldNotUnwrap`.
    ///
    /// # Errors
    ///
    /// Only configuration problems: the oblivious collaborator is missing for
    /// an oblivious wrap, or the identity collaborator fails.
    pub fn unwrap_message_key(
        owned: &CryptoIdentity,
        wrapped_key: &[u8],
        collaborators: &Collaborators,
    ) -> Result<UnwrapOutcome, ChannelError> {
        let Some((&tag, wrapped)) = wrapped_key.split_first() else {
            return Ok(UnwrapOutcome::CouldNotUnwrap);
        };
        if !collaborators.identity.is_owned_identity(owned)? {
            tracing::debug!(owned = %owned, "message key addressed to an identity we do not own");
            return Ok(UnwrapOutcome::CouldNotUnwrap);
        }

        match tag {
            wrap_tag::ASYMMETRIC => {
                let private_key = collaborators.identity.owned_private_key(owned)?;
                Ok(match wrap::unwrap_key(&private_key, wrapped) {
                    Ok(key) => UnwrapOutcome::Unwrapped {
                        key,
                        channel_info: ReceptionChannelInfo::AsymmetricChannel,
                    },
                    Err(err) => {
                        tracing::debug!(owned = %owned, error = %err, "asymmetric unwrap failed");
                        UnwrapOutcome::CouldNotUnwrap
                    },
                })
            },
            wrap_tag::OBLIVIOUS => {
                let oblivious = collaborators.oblivious()?;
                Ok(match oblivious.unwrap_message_key(owned, wrapped) {
                    Some((key, remote_identity, remote_device)) => UnwrapOutcome::Unwrapped {
                        key,
                        channel_info: ReceptionChannelInfo::ObliviousChannel {
                            remote_identity,
                            remote_device,
                        },
                    },
                    None => UnwrapOutcome::CouldNotUnwrap,
                })
            },
            _ => Ok(UnwrapOutcome::CouldNotUnwrap),
        }
    }

    /// Recover the content of an envelope addressed to one of our identities.
    ///
    /// # Errors
    ///
    /// Same as [`Self::unwrap_message_key`].
    pub fn open_envelope(&self, envelope: &Envelope) -> Result<OpenedEnvelope, ChannelError> {
        let owned = &envelope.to_identity;
        let message_id = MessageId { owned_identity: owned.clone(), uid: envelope.message_uid };

        let UnwrapOutcome::Unwrapped { key, channel_info } =
            Self::unwrap_message_key(owned, &envelope.wrapped_key, self.collaborators())?
        else {
            tracing::debug!(owned = %owned, uid = ?envelope.message_uid, "could not unwrap message key");
            return Ok(OpenedEnvelope::Undecryptable { message_id });
        };

        let content = match aead::open(&key, &envelope.encrypted_content) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(owned = %owned, error = %err, "envelope content did not decrypt");
                return Ok(OpenedEnvelope::Undecryptable { message_id });
            },
        };

        match encoding::decode::<ChannelMessage>(&content) {
            Ok(ChannelMessage::Protocol(protocol_message)) => {
                Ok(OpenedEnvelope::Protocol(ReceivedMessage {
                    message_id,
                    reception: channel_info,
                    payload: ReceivedPayload::Protocol(protocol_message),
                }))
            },
            Ok(ChannelMessage::Application(content)) => {
                Ok(OpenedEnvelope::Application { message_id, reception: channel_info, content })
            },
            Err(err) => {
                tracing::warn!(owned = %owned, error = %err, "envelope content did not decode");
                Ok(OpenedEnvelope::Undecryptable { message_id })
            },
        }
    }
}
