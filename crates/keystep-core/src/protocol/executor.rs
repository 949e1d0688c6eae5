//! Protocol executor.
//!
//! Routes received messages to protocol instances and runs one step per
//! message. The lifecycle of a message:
//!
//! ```text
//! received ──► persisted as pending ──► instance lock ──► step lookup
//!                                                            │
//!          ┌─────────────────────────────────────────────────┘
//!          ▼
//!   expectation check ──► execute ──► commit (state + pending removal + effects)
//!                                        │
//!                                        └──► local deliveries (bounded cascade)
//! ```
//!
//! A crash anywhere before the commit leaves the previous state and the
//! pending message in storage; [`ProtocolExecutor::replay_pending`] picks it
//! up again.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use keystep_proto::{
    CryptoIdentity, Envelope, MessageId, ProtocolId, ProtocolMessage, ServerResponse, Uid,
    encoding,
};

use super::{ProtocolDefinition, ProtocolMessageBody, ProtocolState, step::StepContext};
use crate::{
    channel::{
        ChannelManager, OpenedEnvelope, ReceivedMessage, ReceivedPayload, ReceptionChannelInfo,
    },
    config::EngineConfig,
    delegate::Collaborators,
    env::Environment,
    error::{EngineError, StepError},
    protocols,
    storage::{InstanceKey, Storage, StorageBatch},
    transaction::UnitOfWork,
};

/// Why a message was consumed without running a step.
///
/// All of these are expected under duplicate or reordered delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The addressed identity is not owned on this device
    UnknownOwnedIdentity,
    /// The owned identity is deactivated
    InactiveOwnedIdentity,
    /// The instance already reached a terminal state
    InstanceFinished,
    /// No step accepts the current state and this message
    NoMatchingStep,
    /// The message arrived on a channel the step does not accept
    ChannelExpectationMismatch,
    /// The body is not a message of the addressed protocol
    UndecodableMessage,
    /// The protocol does not expect this server response
    UnexpectedServerResponse,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::UnknownOwnedIdentity => "unknown owned identity",
            Self::InactiveOwnedIdentity => "inactive owned identity",
            Self::InstanceFinished => "instance finished",
            Self::NoMatchingStep => "no matching step",
            Self::ChannelExpectationMismatch => "channel expectation mismatch",
            Self::UndecodableMessage => "undecodable message",
            Self::UnexpectedServerResponse => "unexpected server response",
        };
        f.write_str(reason)
    }
}

/// What processing one message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A step ran and its new state was committed
    Advanced {
        /// Protocol of the instance
        protocol_id: ProtocolId,
        /// Instance that advanced
        instance_uid: Uid,
        /// Step that ran
        step: String,
        /// True if the instance is now finished
        terminal: bool,
    },
    /// A step moved the instance to its cancelled state
    Cancelled {
        /// Protocol of the instance
        protocol_id: ProtocolId,
        /// Instance that was cancelled
        instance_uid: Uid,
        /// Step that cancelled
        step: String,
    },
    /// The message was consumed without running a step
    Dropped(DropReason),
    /// The step asked for a rollback; only the message was consumed
    RolledBack {
        /// Step that rolled back
        step: String,
    },
    /// The step failed; the previous state is untouched
    Aborted {
        /// Protocol of the instance
        protocol_id: ProtocolId,
        /// Instance whose step failed
        instance_uid: Uid,
        /// Cause
        error: StepError,
    },
}

impl ProcessOutcome {
    /// True if a new state was committed.
    pub fn advanced(&self) -> bool {
        matches!(self, Self::Advanced { .. } | Self::Cancelled { .. })
    }
}

/// Result of [`ProtocolExecutor::receive_envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeOutcome {
    /// A protocol message was processed
    Processed(ProcessOutcome),
    /// Application content for the caller
    Application {
        /// Message identifier
        message_id: MessageId,
        /// How it arrived
        reception: ReceptionChannelInfo,
        /// Decrypted content
        content: Vec<u8>,
    },
    /// The envelope could not be opened
    Undecryptable {
        /// Message identifier
        message_id: MessageId,
    },
}

/// Stored instance with its decoded state rendered for humans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    /// Instance key
    pub key: InstanceKey,
    /// Debug rendering of the state kind, or `None` if it no longer decodes
    pub state: Option<String>,
}

/// Whether a step's unit of work is committed or discarded.
pub(crate) enum Verdict {
    Commit(ProcessOutcome),
    Discard(ProcessOutcome),
}

/// Runs protocol steps against storage and collaborators.
///
/// Steps of one instance are serialized by a per-instance lock; steps of
/// different instances may run concurrently from different threads.
pub struct ProtocolExecutor<E: Environment, S: Storage> {
    storage: S,
    channels: ChannelManager<E>,
    config: EngineConfig,
    locks: Mutex<HashMap<InstanceKey, Arc<Mutex<()>>>>,
}

impl<E: Environment, S: Storage> ProtocolExecutor<E, S> {
    /// Bind storage and every collaborator up front.
    pub fn new(env: E, storage: S, collaborators: Collaborators, config: EngineConfig) -> Self {
        Self {
            storage,
            channels: ChannelManager::new(env, collaborators),
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Channel layer.
    pub fn channels(&self) -> &ChannelManager<E> {
        &self.channels
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open an inbound envelope and process it if it carries a protocol
    /// message.
    pub fn receive_envelope(&self, envelope: &Envelope) -> Result<EnvelopeOutcome, EngineError> {
        match self.channels.open_envelope(envelope)? {
            OpenedEnvelope::Protocol(message) => {
                Ok(EnvelopeOutcome::Processed(self.process_received_message(message)?))
            },
            OpenedEnvelope::Application { message_id, reception, content } => {
                Ok(EnvelopeOutcome::Application { message_id, reception, content })
            },
            OpenedEnvelope::Undecryptable { message_id } => {
                Ok(EnvelopeOutcome::Undecryptable { message_id })
            },
        }
    }

    /// Route a server response back to the instance that asked.
    ///
    /// Responses arrive from the fetch collaborator on this device, so they
    /// are received on the local channel.
    pub fn receive_server_response(
        &self,
        response: ServerResponse,
    ) -> Result<ProcessOutcome, EngineError> {
        let message = ReceivedMessage {
            message_id: MessageId {
                owned_identity: response.owned_identity.clone(),
                uid: self.channels.env().random_uid(),
            },
            reception: ReceptionChannelInfo::Local,
            payload: ReceivedPayload::ServerResponse(response),
        };
        self.process_received_message(message)
    }

    /// Start a new instance of `P` with a local initial message.
    ///
    /// Returns the instance uid and the outcome of the first step.
    pub fn start_protocol<P: ProtocolDefinition>(
        &self,
        owned: &CryptoIdentity,
        message: &P::Message,
    ) -> Result<(Uid, ProcessOutcome), EngineError> {
        let env = self.channels.env();
        let instance_uid = env.random_uid();
        let received = ReceivedMessage {
            message_id: MessageId { owned_identity: owned.clone(), uid: env.random_uid() },
            reception: ReceptionChannelInfo::Local,
            payload: ReceivedPayload::Protocol(ProtocolMessage {
                protocol_id: P::ID,
                instance_uid,
                body: encoding::encode(message)?,
            }),
        };

        let outcome = self.process_received_message(received)?;
        Ok((instance_uid, outcome))
    }

    /// Persist `message` as pending, then process it and the local messages
    /// it causes.
    ///
    /// Returns the outcome for `message` itself. Expected divergence is an
    /// `Ok` outcome, never an error.
    ///
    /// # Errors
    ///
    /// `EngineError` if storage or an identity lookup fails. The message
    /// stays pending in that case.
    pub fn process_received_message(
        &self,
        message: ReceivedMessage,
    ) -> Result<ProcessOutcome, EngineError> {
        let mut batch = StorageBatch::new();
        batch.put_pending(message.message_id.clone(), encoding::encode(&message)?);
        self.storage.commit(&batch)?;

        self.run_cascade(message)
    }

    /// Re-deliver every message still pending for `owned`.
    ///
    /// Replay follows storage order, not arrival order; steps re-validate
    /// versions, so the order does not matter.
    ///
    /// Pending entries that no longer decode are removed.
    pub fn replay_pending(&self, owned: &CryptoIdentity) -> Result<Vec<ProcessOutcome>, EngineError> {
        let pending = self.storage.load_pending(owned)?;
        tracing::info!(owned = %owned, count = pending.len(), "replaying pending messages");

        let mut outcomes = Vec::with_capacity(pending.len());
        for (uid, encoded) in pending {
            let message = match encoding::decode::<ReceivedMessage>(&encoded) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(owned = %owned, uid = ?uid, error = %err, "discarding corrupt pending message");
                    let mut batch = StorageBatch::new();
                    batch.remove_pending(MessageId { owned_identity: owned.clone(), uid });
                    self.storage.commit(&batch)?;
                    continue;
                },
            };
            outcomes.push(self.run_cascade(message)?);
        }
        Ok(outcomes)
    }

    /// Remove every instance, tombstone and pending message of `owned`.
    ///
    /// Steps already holding an instance lock finish first; anything they
    /// commit afterwards is not removed.
    pub fn delete_all_instances(&self, owned: &CryptoIdentity) -> Result<usize, EngineError> {
        let removed = self.storage.delete_identity(owned)?;
        tracing::info!(owned = %owned, removed, "deleted all protocol instances");
        Ok(removed)
    }

    /// Live instances of `owned`.
    pub fn instances(&self, owned: &CryptoIdentity) -> Result<Vec<InstanceSummary>, EngineError> {
        Ok(self
            .storage
            .list_instances(owned)?
            .into_iter()
            .map(|stored| InstanceSummary {
                state: protocols::describe_state(stored.key.protocol_id, &stored.encoded_state),
                key: stored.key,
            })
            .collect())
    }

    /// Decoded state of one live instance of `P`.
    pub fn load_state<P: ProtocolDefinition>(
        &self,
        owned: &CryptoIdentity,
        instance_uid: Uid,
    ) -> Result<Option<P::State>, EngineError> {
        let key = InstanceKey { owned_identity: owned.clone(), protocol_id: P::ID, instance_uid };
        match self.storage.load_instance(&key)? {
            Some(bytes) => Ok(Some(encoding::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// True if the instance reached a terminal state.
    pub fn is_finished(
        &self,
        owned: &CryptoIdentity,
        protocol_id: ProtocolId,
        instance_uid: Uid,
    ) -> Result<bool, EngineError> {
        let key = InstanceKey { owned_identity: owned.clone(), protocol_id, instance_uid };
        Ok(self.storage.is_finished(&key)?)
    }

    /// Process `first`, then the local deliveries it produced, breadth first.
    ///
    /// At most `max_local_deliveries_per_message` follow-ups run; the rest
    /// stay pending for the next replay.
    fn run_cascade(&self, first: ReceivedMessage) -> Result<ProcessOutcome, EngineError> {
        let (outcome, deliveries) = self.execute_one(&first)?;
        let mut queue = VecDeque::from(deliveries);
        let mut processed = 0;

        while let Some(message) = queue.pop_front() {
            if processed == self.config.max_local_deliveries_per_message {
                tracing::warn!(
                    owned = %first.message_id.owned_identity,
                    left_pending = queue.len() + 1,
                    "local delivery limit reached"
                );
                break;
            }
            processed += 1;

            match self.execute_one(&message) {
                Ok((child, more)) => {
                    tracing::debug!(outcome = ?child, "local delivery processed");
                    queue.extend(more);
                },
                Err(err) => {
                    tracing::warn!(error = %err, "local delivery failed, left pending");
                    break;
                },
            }
        }

        Ok(outcome)
    }

    fn execute_one(
        &self,
        message: &ReceivedMessage,
    ) -> Result<(ProcessOutcome, Vec<ReceivedMessage>), EngineError> {
        let (protocol_id, instance_uid) = match &message.payload {
            ReceivedPayload::Protocol(pm) => (pm.protocol_id, pm.instance_uid),
            ReceivedPayload::ServerResponse(response) => {
                (response.origin.protocol_id, response.origin.instance_uid)
            },
        };
        let key = InstanceKey {
            owned_identity: message.message_id.owned_identity.clone(),
            protocol_id,
            instance_uid,
        };

        self.with_instance_lock(&key, || self.execute_locked(&key, message))
    }

    fn execute_locked(
        &self,
        key: &InstanceKey,
        message: &ReceivedMessage,
    ) -> Result<(ProcessOutcome, Vec<ReceivedMessage>), EngineError> {
        let collaborators = self.channels.collaborators();
        let owned = &key.owned_identity;
        let mut uow = UnitOfWork::new(owned.clone());

        let verdict = if !collaborators.identity.is_owned_identity(owned)? {
            Verdict::Discard(ProcessOutcome::Dropped(DropReason::UnknownOwnedIdentity))
        } else if !collaborators.identity.is_active(owned)? {
            Verdict::Discard(ProcessOutcome::Dropped(DropReason::InactiveOwnedIdentity))
        } else if self.storage.is_finished(key)? {
            Verdict::Discard(ProcessOutcome::Dropped(DropReason::InstanceFinished))
        } else {
            let current = self.storage.load_instance(key)?;
            protocols::dispatch(key, current.as_deref(), message, &self.channels, &mut uow)
        };

        if let Verdict::Discard(ProcessOutcome::Dropped(reason)) = &verdict {
            tracing::debug!(
                owned = %owned,
                protocol = %key.protocol_id,
                instance = ?key.instance_uid,
                %reason,
                "message dropped"
            );
        }

        match verdict {
            Verdict::Commit(outcome) => {
                uow.mark_processed(message.message_id.clone());
                let report = uow.commit(&self.storage, collaborators)?;
                Ok((outcome, report.local_deliveries))
            },
            Verdict::Discard(outcome) => {
                uow.rollback();
                let mut consume = UnitOfWork::new(owned.clone());
                consume.mark_processed(message.message_id.clone());
                consume.commit(&self.storage, collaborators)?;
                Ok((outcome, Vec::new()))
            },
        }
    }

    fn with_instance_lock<T>(&self, key: &InstanceKey, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
        result
    }
}

/// Run one step of `P` for `message` against the instance's current state.
pub(crate) fn run_protocol<P: ProtocolDefinition, E: Environment>(
    key: &InstanceKey,
    current: Option<&[u8]>,
    message: &ReceivedMessage,
    channels: &ChannelManager<E>,
    uow: &mut UnitOfWork,
) -> Verdict {
    let _span = tracing::debug_span!(
        "step",
        protocol = %P::ID,
        instance = ?key.instance_uid,
        owned = %key.owned_identity
    )
    .entered();

    let aborted = |error: StepError| {
        Verdict::Discard(ProcessOutcome::Aborted {
            protocol_id: P::ID,
            instance_uid: key.instance_uid,
            error,
        })
    };

    let state = match current {
        None => P::State::initial(),
        Some(bytes) => match encoding::decode::<P::State>(bytes) {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(error = %err, "stored state does not decode");
                return aborted(StepError::Encoding(err));
            },
        },
    };

    let body = match &message.payload {
        ReceivedPayload::Protocol(pm) => match encoding::decode::<P::Message>(&pm.body) {
            Ok(body) => body,
            Err(err) => {
                tracing::debug!(error = %err, "message body does not decode");
                return Verdict::Discard(ProcessOutcome::Dropped(DropReason::UndecodableMessage));
            },
        },
        ReceivedPayload::ServerResponse(response) => {
            match P::Message::from_server_response(response) {
                Some(body) => body,
                None => {
                    return Verdict::Discard(ProcessOutcome::Dropped(
                        DropReason::UnexpectedServerResponse,
                    ));
                },
            }
        },
    };

    let Some(row) = P::find_step(&state, &body) else {
        tracing::debug!(state = ?state.kind(), message = ?body.kind(), "no step matches");
        return Verdict::Discard(ProcessOutcome::Dropped(DropReason::NoMatchingStep));
    };

    if !row.expectation.accepts(&message.reception, &key.owned_identity) {
        tracing::debug!(
            step = ?row.id,
            expectation = ?row.expectation,
            reception = ?message.reception,
            "channel expectation not met"
        );
        return Verdict::Discard(ProcessOutcome::Dropped(DropReason::ChannelExpectationMismatch));
    }

    let step = format!("{:?}", row.id);
    let mut ctx = StepContext::new(P::ID, key.instance_uid, &message.reception, channels, uow);
    let next = match P::execute(row.id, state, body, &mut ctx) {
        Ok(Some(next)) => next,
        Ok(None) => {
            tracing::debug!(%step, "step rolled back");
            return Verdict::Discard(ProcessOutcome::RolledBack { step });
        },
        Err(error) => {
            if error.is_fatal() {
                tracing::error!(%step, %error, "step aborted");
            } else {
                tracing::warn!(%step, %error, "step aborted");
            }
            return aborted(error);
        },
    };

    let terminal = next.is_terminal();
    if terminal {
        uow.finish_instance(key.clone());
    } else {
        match encoding::encode(&next) {
            Ok(bytes) => uow.put_instance(key.clone(), bytes),
            Err(err) => return aborted(StepError::Encoding(err)),
        }
    }

    if next.is_cancelled() {
        tracing::info!(%step, "instance cancelled");
        Verdict::Commit(ProcessOutcome::Cancelled {
            protocol_id: P::ID,
            instance_uid: key.instance_uid,
            step,
        })
    } else {
        tracing::info!(%step, state = ?next.kind(), terminal, "step committed");
        Verdict::Commit(ProcessOutcome::Advanced {
            protocol_id: P::ID,
            instance_uid: key.instance_uid,
            step,
            terminal,
        })
    }
}
