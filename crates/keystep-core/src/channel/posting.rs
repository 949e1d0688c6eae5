//! Channel selection and posting.

use bytes::Bytes;
use keystep_crypto::{
    AuthenticatedEncryptionKey, PublicKeyForEncryption, aead,
    wrap::{self, WRAP_RANDOMNESS_SIZE},
};
use keystep_proto::{ChannelMessage, CryptoIdentity, DeviceUid, Envelope, MessageId, encoding};

use super::{
    Channel, OutgoingMessage, OutgoingPayload, ReceivedMessage, ReceivedPayload,
    ReceptionChannelInfo, SendChannelType, server, wrap_tag,
};
use crate::{
    delegate::Collaborators, env::Environment, error::ChannelError, transaction::UnitOfWork,
};

/// Resolve a message's channel policy into concrete channels.
///
/// Reads collaborators but changes nothing. An empty list means no
/// destination is currently reachable, for instance a contact without any
/// confirmed channel yet.
///
/// # Errors
///
/// - `UnknownOwnedIdentity` if the posting identity is not owned here
/// - `IncompatiblePayload` if the payload may not use the channel
/// - `MissingDelegate` if oblivious channels are requested but not configured
pub fn acceptable_channels_for_posting(
    message: &OutgoingMessage,
    collaborators: &Collaborators,
) -> Result<Vec<Channel>, ChannelError> {
    let owned = &message.owned_identity;
    if !collaborators.identity.is_owned_identity(owned)? {
        return Err(ChannelError::UnknownOwnedIdentity(owned.clone()));
    }

    let compatible = match (&message.channel, &message.payload) {
        (SendChannelType::ServerQuery, OutgoingPayload::ServerQuery { .. }) => true,
        (SendChannelType::ServerQuery, _) | (_, OutgoingPayload::ServerQuery { .. }) => false,
        (
            SendChannelType::Local
            | SendChannelType::AsymmetricChannel { .. }
            | SendChannelType::AsymmetricChannelBroadcast { .. },
            payload,
        ) => matches!(payload, OutgoingPayload::Protocol(_)),
        (
            SendChannelType::ObliviousChannel { .. }
            | SendChannelType::AllObliviousChannelsWithContact { .. }
            | SendChannelType::AllOwnedDevices,
            _,
        ) => true,
    };
    if !compatible {
        return Err(ChannelError::IncompatiblePayload {
            payload: message.payload.name(),
            channel: message.channel.name(),
        });
    }

    let channels = match &message.channel {
        SendChannelType::Local => vec![Channel::Local],
        SendChannelType::ServerQuery => vec![Channel::ServerQuery],
        SendChannelType::AsymmetricChannel { to, device_uids } => device_uids
            .iter()
            .map(|device| Channel::AsymmetricChannel { to: to.clone(), device: *device })
            .collect(),
        SendChannelType::AsymmetricChannelBroadcast { to } => {
            vec![Channel::AsymmetricChannelBroadcast { to: to.clone() }]
        },
        SendChannelType::ObliviousChannel { to, device_uids } => {
            let confirmed = collaborators.oblivious()?.confirmed_channel_devices(owned, to)?;
            device_uids
                .iter()
                .filter(|device| confirmed.contains(device))
                .map(|device| Channel::ObliviousChannel { to: to.clone(), device: *device })
                .collect()
        },
        SendChannelType::AllObliviousChannelsWithContact { contact } => collaborators
            .oblivious()?
            .confirmed_channel_devices(owned, contact)?
            .into_iter()
            .map(|device| Channel::ObliviousChannel { to: contact.clone(), device })
            .collect(),
        SendChannelType::AllOwnedDevices => {
            let current = collaborators.identity.current_device_uid(owned)?;
            collaborators
                .oblivious()?
                .confirmed_channel_devices(owned, owned)?
                .into_iter()
                .filter(|device| *device != current)
                .map(|device| Channel::ObliviousChannel { to: owned.clone(), device })
                .collect()
        },
    };

    Ok(channels)
}

/// Posts messages and opens envelopes on behalf of the executor.
pub struct ChannelManager<E: Environment> {
    env: E,
    collaborators: Collaborators,
}

impl<E: Environment> ChannelManager<E> {
    /// Bind the environment and collaborators.
    pub fn new(env: E, collaborators: Collaborators) -> Self {
        Self { env, collaborators }
    }

    /// Randomness source.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Bound collaborators.
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Stage `message` on `uow`, one envelope per resolved channel.
    ///
    /// Returns one fresh [`MessageId`] per staged delivery. An empty result
    /// means no channel was available; that is not an error. Channels that
    /// refuse to wrap the key are logged and skipped.
    ///
    /// # Errors
    ///
    /// Everything [`acceptable_channels_for_posting`] returns, plus
    /// `CouldNotWrapForAnyChannel` when every channel refused.
    pub fn post(
        &self,
        uow: &mut UnitOfWork,
        message: OutgoingMessage,
    ) -> Result<Vec<MessageId>, ChannelError> {
        let channels = acceptable_channels_for_posting(&message, &self.collaborators)?;
        if channels.is_empty() {
            tracing::debug!(
                owned = %message.owned_identity,
                channel = message.channel.name(),
                "no channel available, nothing posted"
            );
            return Ok(Vec::new());
        }

        let owned = message.owned_identity;
        match message.payload {
            OutgoingPayload::ServerQuery { origin, intent, context } => {
                Ok(vec![server::post_server_query(uow, &self.env, origin, intent, context)])
            },
            OutgoingPayload::Protocol(protocol_message)
                if matches!(channels.as_slice(), [Channel::Local]) =>
            {
                let message_id = MessageId { owned_identity: owned, uid: self.env.random_uid() };
                uow.push_local_delivery(ReceivedMessage {
                    message_id: message_id.clone(),
                    reception: ReceptionChannelInfo::Local,
                    payload: ReceivedPayload::Protocol(protocol_message),
                })?;
                Ok(vec![message_id])
            },
            OutgoingPayload::Protocol(protocol_message) => self.seal_and_post(
                uow,
                &owned,
                &channels,
                &ChannelMessage::Protocol(protocol_message),
            ),
            OutgoingPayload::Application(content) => {
                self.seal_and_post(uow, &owned, &channels, &ChannelMessage::Application(content))
            },
        }
    }

    /// Encrypt once, wrap the content key per channel.
    fn seal_and_post(
        &self,
        uow: &mut UnitOfWork,
        owned: &CryptoIdentity,
        channels: &[Channel],
        content: &ChannelMessage,
    ) -> Result<Vec<MessageId>, ChannelError> {
        let plaintext = encoding::encode(content)?;
        let key = AuthenticatedEncryptionKey::from_bytes(self.env.random_array());
        let encrypted_content = Bytes::from(aead::seal(&key, &plaintext, self.env.random_array()));

        let mut message_ids = Vec::with_capacity(channels.len());
        for channel in channels {
            let Some((to_identity, to_devices, wrapped_key)) = self.wrap_for(owned, channel, &key)
            else {
                tracing::warn!(owned = %owned, ?channel, "could not wrap message key, skipping");
                continue;
            };

            let message_uid = self.env.random_uid();
            uow.push_envelope(Envelope {
                message_uid,
                to_identity: to_identity.clone(),
                to_devices,
                wrapped_key,
                encrypted_content: encrypted_content.clone(),
            });
            message_ids.push(MessageId { owned_identity: to_identity, uid: message_uid });
        }

        if message_ids.is_empty() {
            return Err(ChannelError::CouldNotWrapForAnyChannel);
        }
        Ok(message_ids)
    }

    /// `None` when the channel cannot wrap; the caller skips it.
    fn wrap_for(
        &self,
        owned: &CryptoIdentity,
        channel: &Channel,
        key: &AuthenticatedEncryptionKey,
    ) -> Option<(CryptoIdentity, Vec<DeviceUid>, Vec<u8>)> {
        let (to, devices, tag, wrapped) = match channel {
            Channel::AsymmetricChannel { to, device } => {
                (to, vec![*device], wrap_tag::ASYMMETRIC, self.wrap_asymmetric(to, key)?)
            },
            Channel::AsymmetricChannelBroadcast { to } => {
                (to, Vec::new(), wrap_tag::ASYMMETRIC, self.wrap_asymmetric(to, key)?)
            },
            Channel::ObliviousChannel { to, device } => {
                let wrapped = self
                    .collaborators
                    .oblivious
                    .as_deref()?
                    .wrap_message_key(owned, to, *device, key)?;
                (to, vec![*device], wrap_tag::OBLIVIOUS, wrapped)
            },
            Channel::Local | Channel::ServerQuery => return None,
        };

        let mut wrapped_key = Vec::with_capacity(1 + wrapped.len());
        wrapped_key.push(tag);
        wrapped_key.extend_from_slice(&wrapped);
        Some((to.clone(), devices, wrapped_key))
    }

    fn wrap_asymmetric(
        &self,
        to: &CryptoIdentity,
        key: &AuthenticatedEncryptionKey,
    ) -> Option<Vec<u8>> {
        let public_key = PublicKeyForEncryption::from_bytes(*to.encryption_key()).ok()?;
        let randomness: [u8; WRAP_RANDOMNESS_SIZE] = self.env.random_array();
        wrap::wrap_key(&public_key, key, &randomness).ok()
    }
}
