//! Protocol state machines.
//!
//! A protocol is a closed set of states, a closed set of messages and a
//! static step table. Each row of the table pairs one state kind with one
//! message kind and names the reception channel the step accepts:
//!
//! ```text
//!   (state kind, message kind) ──► StepId ──► execute(step, state, message)
//! ```
//!
//! The executor looks the pair up, checks the channel expectation, then runs
//! the step inside a [`crate::UnitOfWork`]. A step returns the next state,
//! or `None` to roll back. Duplicate table rows are rejected at compile time
//! by [`assert_unique_steps!`](crate::assert_unique_steps).

pub mod executor;
pub mod step;

use std::fmt::Debug;

use keystep_proto::{ProtocolId, ServerResponse};
use serde::{Serialize, de::DeserializeOwned};

use crate::{channel::ChannelExpectation, env::Environment, error::StepError};
use self::step::StepContext;

/// State of one protocol instance.
pub trait ProtocolState: Serialize + DeserializeOwned + Clone + Debug + Send {
    /// Fieldless discriminant used by the step table
    type Kind: Copy + Eq + Debug + 'static;

    /// Discriminant of this state.
    fn kind(&self) -> Self::Kind;

    /// State of an instance that does not exist yet.
    fn initial() -> Self;

    /// True for `Cancelled`.
    fn is_cancelled(&self) -> bool;

    /// True if the instance is done; terminal instances are pruned.
    fn is_terminal(&self) -> bool;
}

/// Message consumed by a protocol's steps.
pub trait ProtocolMessageBody: Serialize + DeserializeOwned + Debug + Send {
    /// Fieldless discriminant used by the step table
    type Kind: Copy + Eq + Debug + 'static;

    /// Discriminant of this message.
    fn kind(&self) -> Self::Kind;

    /// Map a server response routed to this protocol onto a message.
    ///
    /// `None` if the protocol does not expect this response.
    fn from_server_response(response: &ServerResponse) -> Option<Self> {
        let _ = response;
        None
    }
}

/// One row of a step table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDescriptor<S: 'static, M: 'static, Id: 'static> {
    /// Step to run
    pub id: Id,
    /// State kind the step consumes
    pub state: S,
    /// Message kind the step consumes
    pub message: M,
    /// Channel the message must have arrived on
    pub expectation: ChannelExpectation,
}

/// Step table type of a protocol.
pub type StepTable<P> = &'static [StepDescriptor<
    <<P as ProtocolDefinition>::State as ProtocolState>::Kind,
    <<P as ProtocolDefinition>::Message as ProtocolMessageBody>::Kind,
    <P as ProtocolDefinition>::StepId,
>];

/// A named protocol.
pub trait ProtocolDefinition: 'static {
    /// Wire identifier
    const ID: ProtocolId;

    /// State enum
    type State: ProtocolState;

    /// Message enum
    type Message: ProtocolMessageBody;

    /// Step enum, matched exhaustively by [`Self::execute`]
    type StepId: Copy + Debug + 'static;

    /// Step table
    const STEPS: StepTable<Self>;

    /// Run one step.
    ///
    /// `Ok(None)` rolls the step back; the message is consumed and nothing
    /// else changes.
    fn execute<E: Environment>(
        step: Self::StepId,
        state: Self::State,
        message: Self::Message,
        ctx: &mut StepContext<'_, E>,
    ) -> Result<Option<Self::State>, StepError>;

    /// Row matching the current state and message.
    fn find_step(
        state: &Self::State,
        message: &Self::Message,
    ) -> Option<
        &'static StepDescriptor<
            <Self::State as ProtocolState>::Kind,
            <Self::Message as ProtocolMessageBody>::Kind,
            Self::StepId,
        >,
    > {
        let state_kind = state.kind();
        let message_kind = message.kind();
        Self::STEPS.iter().find(|row| row.state == state_kind && row.message == message_kind)
    }
}

/// Reject duplicate `(state, message)` rows in a step table at compile time.
///
/// Kinds must be fieldless enums so they can be compared as `u8` in a const
/// context.
#[macro_export]
macro_rules! assert_unique_steps {
    ($steps:expr) => {
        const _: () = {
            let steps = $steps;
            let mut i = 0;
            while i < steps.len() {
                let mut j = i + 1;
                while j < steps.len() {
                    assert!(
                        !(steps[i].state as u8 == steps[j].state as u8
                            && steps[i].message as u8 == steps[j].message as u8),
                        "duplicate (state, message) pair in step table"
                    );
                    j += 1;
                }
                i += 1;
            }
        };
    };
}
