//! Keystep protocol engine.
//!
//! Runs multi-step cryptographic protocols between the devices of owned
//! identities and their contacts. The engine owns protocol state and
//! nothing else: identities, device channels and the network are
//! collaborators bound at construction.
//!
//! # Architecture
//!
//! ```text
//!  Envelope / ServerResponse
//!           │
//!           ▼
//!   ChannelManager::open_envelope ──► ProtocolExecutor ──► protocols::*
//!                                         │                    │
//!                                         │◄── StepContext ────┘
//!                                         ▼
//!                                     UnitOfWork ──commit──► Storage
//!                                         │                  collaborators
//!                                         └──► local deliveries (next steps)
//! ```
//!
//! - [`protocol`]: step tables, the executor and the step context
//! - [`protocols`]: identity details publication, device discovery, channel
//!   creation
//! - [`channel`]: channel selection, key wrapping, envelope opening
//! - [`transaction`]: the unit of work that makes a step atomic
//! - [`storage`]: instance, tombstone and pending message persistence
//! - [`runtime`]: per-identity tokio workers around the executor
//!
//! Protocol code is synchronous and draws randomness only from
//! [`Environment`], so a seeded environment replays a run exactly.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attachment;
pub mod channel;
pub mod config;
pub mod delegate;
pub mod env;
pub mod error;
pub mod protocol;
pub mod protocols;
pub mod runtime;
pub mod storage;
pub mod transaction;

pub use attachment::AttachmentChunkPlan;
pub use config::{AttachmentConfig, EngineConfig};
pub use delegate::{
    Collaborators, ContactDetails, IdentityDelegate, NetworkFetchDelegate, NetworkSendDelegate,
    ObliviousChannelDelegate, PublishedDetails,
};
pub use env::Environment;
pub use error::{ChannelError, EngineError, IdentityError, StepError};
pub use protocol::{
    ProtocolDefinition,
    executor::{DropReason, EnvelopeOutcome, InstanceSummary, ProcessOutcome, ProtocolExecutor},
    step::StepContext,
};
pub use runtime::EngineRuntime;
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError};
pub use transaction::{CommitReport, UnitOfWork};
