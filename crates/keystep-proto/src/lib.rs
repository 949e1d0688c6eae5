//! Keystep wire types.
//!
//! Identifiers, identities, protocol messages and server queries shared by
//! the engine and its collaborators. Everything that is persisted or crosses
//! a process boundary is CBOR-encoded through [`encoding`].
//!
//! # Message Flow
//!
//! ```text
//! Step ──post──► ChannelMessage ──seal──► Envelope ──► network
//!                                                        │
//! Step ◄──ProtocolMessage◄──open──◄ Envelope ◄───────────┘
//!
//! Step ──post──► ServerQuery ──► server ──► ServerResponse ──► Step
//! ```

#![forbid(unsafe_code)]

pub mod encoding;
pub mod errors;
pub mod identity;
pub mod message;
pub mod server_query;
pub mod uid;

pub use errors::{ProtocolError, Result};
pub use identity::CryptoIdentity;
pub use message::{ChannelMessage, Envelope, MessageId, ProtocolId, ProtocolMessage};
pub use server_query::{
    ProtocolOrigin, ServerQuery, ServerQueryKind, ServerResponse, ServerResponseKind,
};
pub use uid::{DeviceUid, UID_LEN, Uid};
