//! Deterministic simulation harness for keystep protocol testing.
//!
//! In-memory implementations of every engine collaborator, a seeded
//! [`Environment`](keystep_core::Environment) and a scripted server, wired
//! together by [`SimWorld`]. Delivery order is chosen by the test, so
//! reordering, duplication and loss are all reproducible from a seed.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties of a quiet world (channels
//! confirmed at both ends, no message left pending) against a
//! [`WorldSnapshot`], independent of the scenario that produced it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod identity_store;
pub mod invariants;
pub mod network;
pub mod oblivious;
pub mod sim_env;
pub mod sim_server;
pub mod world;

pub use identity_store::InMemoryIdentityStore;
pub use invariants::{
    ChannelSymmetry, DetailsNotAhead, DeviceSnapshot, Invariant, InvariantRegistry,
    InvariantResult, NothingPending, Violation, WorldSnapshot,
};
pub use network::RecordingNetwork;
pub use oblivious::InMemoryObliviousChannels;
pub use sim_env::SimEnv;
pub use sim_server::SimServer;
pub use world::{MAX_ROUNDS, RunReport, SIM_SERVER_URL, SimDevice, SimWorld};
