//! Everything a step may touch while it runs.

use keystep_proto::{
    CryptoIdentity, MessageId, ProtocolId, ProtocolMessage, ProtocolOrigin, Uid, encoding,
};

use super::{ProtocolDefinition, ProtocolMessageBody};
use crate::{
    channel::{
        ChannelManager, OutgoingMessage, OutgoingPayload, ReceptionChannelInfo, SendChannelType,
        ServerQueryIntent,
    },
    delegate::{IdentityDelegate, ObliviousChannelDelegate},
    env::Environment,
    error::{ChannelError, StepError},
    transaction::UnitOfWork,
};

/// Capabilities handed to a running step.
///
/// Reads go straight to collaborators. Every effect (posts, collaborator
/// mutations) is staged on the step's [`UnitOfWork`]. Collaborator handles
/// outlive the borrow of the context, so a delegate can be called with
/// [`Self::uow`] as its argument.
pub struct StepContext<'a, E: Environment> {
    protocol_id: ProtocolId,
    instance_uid: Uid,
    reception: &'a ReceptionChannelInfo,
    channels: &'a ChannelManager<E>,
    uow: &'a mut UnitOfWork,
}

impl<'a, E: Environment> StepContext<'a, E> {
    pub(crate) fn new(
        protocol_id: ProtocolId,
        instance_uid: Uid,
        reception: &'a ReceptionChannelInfo,
        channels: &'a ChannelManager<E>,
        uow: &'a mut UnitOfWork,
    ) -> Self {
        Self { protocol_id, instance_uid, reception, channels, uow }
    }

    /// Identity the instance runs for.
    pub fn owned_identity(&self) -> &CryptoIdentity {
        self.uow.owned_identity()
    }

    /// Instance being advanced.
    pub fn instance_uid(&self) -> Uid {
        self.instance_uid
    }

    /// How the triggering message arrived.
    pub fn reception(&self) -> &ReceptionChannelInfo {
        self.reception
    }

    /// Randomness source.
    pub fn env(&self) -> &'a E {
        self.channels.env()
    }

    /// Identity collaborator.
    pub fn identity(&self) -> &'a dyn IdentityDelegate {
        self.channels.collaborators().identity.as_ref()
    }

    /// Oblivious channel collaborator.
    pub fn oblivious(&self) -> Result<&'a dyn ObliviousChannelDelegate, StepError> {
        Ok(self.channels.collaborators().oblivious()?)
    }

    /// The step's unit of work, for staging collaborator mutations.
    pub fn uow(&mut self) -> &mut UnitOfWork {
        self.uow
    }

    /// Post a message to the same instance on the peers' side.
    pub fn post<M: ProtocolMessageBody>(
        &mut self,
        channel: SendChannelType,
        message: &M,
    ) -> Result<Vec<MessageId>, ChannelError> {
        let body = encoding::encode(message)?;
        self.post_protocol_message(
            channel,
            ProtocolMessage { protocol_id: self.protocol_id, instance_uid: self.instance_uid, body },
        )
    }

    /// Start a fresh instance of `P` on this device.
    ///
    /// Returns the child's instance uid. The child runs after this step
    /// commits.
    pub fn spawn_child<P: ProtocolDefinition>(
        &mut self,
        message: &P::Message,
    ) -> Result<Uid, ChannelError> {
        let instance_uid = self.env().random_uid();
        let body = encoding::encode(message)?;
        self.post_protocol_message(
            SendChannelType::Local,
            ProtocolMessage { protocol_id: P::ID, instance_uid, body },
        )?;
        Ok(instance_uid)
    }

    /// Post a server query whose response is routed back to this instance.
    ///
    /// `context` is echoed back on the response.
    pub fn post_server_query(
        &mut self,
        intent: ServerQueryIntent,
        context: Vec<u8>,
    ) -> Result<MessageId, ChannelError> {
        let message = OutgoingMessage {
            owned_identity: self.owned_identity().clone(),
            channel: SendChannelType::ServerQuery,
            payload: OutgoingPayload::ServerQuery {
                origin: ProtocolOrigin {
                    protocol_id: self.protocol_id,
                    instance_uid: self.instance_uid,
                },
                intent,
                context,
            },
        };
        let mut ids = self.channels.post(self.uow, message)?;
        ids.pop().ok_or(ChannelError::CouldNotWrapForAnyChannel)
    }

    fn post_protocol_message(
        &mut self,
        channel: SendChannelType,
        message: ProtocolMessage,
    ) -> Result<Vec<MessageId>, ChannelError> {
        let outgoing = OutgoingMessage {
            owned_identity: self.owned_identity().clone(),
            channel,
            payload: OutgoingPayload::Protocol(message),
        };
        self.channels.post(self.uow, outgoing)
    }
}
