//! In-process simulation: one owner, N contacts, channel creation and a
//! details publication.

use std::path::PathBuf;

use keystep_core::{
    EngineConfig, EngineError, EnvelopeOutcome, IdentityDelegate, IdentityError, MemoryStorage,
    ProcessOutcome, RedbStorage, Storage, StorageError,
    protocols::{
        DeviceDiscovery, IdentityDetailsPublication, device_discovery::DiscoveryMessage,
        identity_publication::PublicationMessage,
    },
};
use keystep_harness::{InvariantRegistry, RunReport, SimWorld, Violation, WorldSnapshot};
use thiserror::Error;

/// Simulation failures.
#[derive(Error, Debug)]
pub enum SimulationError {
    /// The engine returned an error
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Identity setup failed
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// A database could not be opened
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The database directory could not be created
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Traffic was still flowing after the round limit
    #[error("simulation did not settle during {phase}")]
    NotQuiet {
        /// Phase that kept producing traffic
        phase: &'static str,
    },

    /// The settled world broke an invariant
    #[error("{count} invariant violation(s)", count = .0.len())]
    Invariants(Vec<Violation>),
}

/// What to simulate.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Number of contacts of the owner
    pub contacts: usize,
    /// RNG seed
    pub seed: u64,
    /// Directory for one redb file per device; in-memory when `None`
    pub db_dir: Option<PathBuf>,
    /// Engine settings of every device
    pub engine: EngineConfig,
}

/// Counts gathered over a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulationSummary {
    /// Confirmed channels on the owner's device
    pub owner_channels: usize,
    /// Contacts holding the owner's latest details
    pub contacts_updated: usize,
    /// Steps that committed a new state
    pub advanced: usize,
    /// Messages dropped as expected divergence
    pub dropped: usize,
    /// Steps that failed
    pub aborted: usize,
    /// Delivery rounds over all phases
    pub rounds: usize,
}

impl SimulationSummary {
    fn record(&mut self, report: &RunReport) {
        self.rounds += report.rounds;
        let outcomes = report.responses.iter().map(|(_, outcome)| outcome).chain(
            report.envelopes.iter().filter_map(|(_, outcome)| match outcome {
                EnvelopeOutcome::Processed(outcome) => Some(outcome),
                _ => None,
            }),
        );
        for outcome in outcomes {
            self.count(outcome);
        }
    }

    fn count(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Advanced { .. } | ProcessOutcome::Cancelled { .. } => self.advanced += 1,
            ProcessOutcome::Dropped(_) | ProcessOutcome::RolledBack { .. } => self.dropped += 1,
            ProcessOutcome::Aborted { .. } => self.aborted += 1,
        }
    }
}

/// Run the simulation described by `config`.
pub fn run(config: &SimulationConfig) -> Result<SimulationSummary, SimulationError> {
    match &config.db_dir {
        None => {
            let world = SimWorld::<MemoryStorage>::with_config(config.seed, config.engine.clone());
            simulate(world, config.contacts, |_| Ok(MemoryStorage::new()))
        },
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let world = SimWorld::<RedbStorage>::with_config(config.seed, config.engine.clone());
            simulate(world, config.contacts, |name| {
                RedbStorage::open(dir.join(format!("{name}.redb")))
            })
        },
    }
}

fn simulate<S: Storage>(
    mut world: SimWorld<S>,
    contacts: usize,
    mut open_storage: impl FnMut(&str) -> Result<S, StorageError>,
) -> Result<SimulationSummary, SimulationError> {
    let owner = world.add_identity_with_storage("owner", open_storage("owner")?);
    let mut others = Vec::with_capacity(contacts);
    for index in 0..contacts {
        let name = format!("contact-{index}");
        others.push(world.add_identity_with_storage(&name, open_storage(&name)?));
    }
    tracing::info!(contacts, "world ready");

    let mut summary = SimulationSummary::default();

    for contact in &others {
        world.introduce(&owner, contact)?;
        let (_, outcome) = world.start::<DeviceDiscovery>(
            &owner,
            &DiscoveryMessage::Initial { contact: contact.clone() },
        )?;
        summary.count(&outcome);
    }
    settle(&world, &mut summary, "channel creation")?;

    let Some(device) = world.device(&owner) else {
        return Err(IdentityError::UnknownOwnedIdentity(owner).into());
    };
    summary.owner_channels = device.channels().channel_count(&owner);
    tracing::info!(channels = summary.owner_channels, "channels confirmed");

    let version = device.identities().publish_details(&owner, b"owner details".to_vec(), None)?;
    let (_, outcome) = world
        .start::<IdentityDetailsPublication>(&owner, &PublicationMessage::Initial { version })?;
    summary.count(&outcome);
    settle(&world, &mut summary, "details publication")?;

    for contact in &others {
        let Some(contact_device) = world.device(contact) else {
            continue;
        };
        if contact_device.identities().contact_published_version(contact, &owner)? == Some(version) {
            summary.contacts_updated += 1;
        }
    }

    let snapshot = WorldSnapshot::capture(&world)?;
    InvariantRegistry::quiescent().check_all(&snapshot).map_err(SimulationError::Invariants)?;

    tracing::info!(
        channels = summary.owner_channels,
        updated = summary.contacts_updated,
        advanced = summary.advanced,
        dropped = summary.dropped,
        aborted = summary.aborted,
        rounds = summary.rounds,
        "simulation complete"
    );
    Ok(summary)
}

fn settle<S: Storage>(
    world: &SimWorld<S>,
    summary: &mut SimulationSummary,
    phase: &'static str,
) -> Result<(), SimulationError> {
    let report = world.run_until_quiet()?;
    summary.record(&report);
    if !report.quiet {
        return Err(SimulationError::NotQuiet { phase });
    }
    tracing::debug!(phase, rounds = report.rounds, "phase settled");
    Ok(())
}
