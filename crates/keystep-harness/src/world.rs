//! A handful of simulated devices sharing one server and one RNG stream.
//!
//! Nothing is delivered on its own. Tests either call
//! [`SimWorld::run_until_quiet`] or drive delivery by hand with
//! [`SimWorld::pending_envelopes`], [`SimWorld::deliver`] and
//! [`SimWorld::deliver_queries`] to reorder, drop or duplicate traffic.

use std::sync::Arc;

use keystep_core::{
    Collaborators, EngineConfig, EngineError, EnvelopeOutcome, Environment, IdentityError,
    MemoryStorage, ProcessOutcome, ProtocolDefinition, ProtocolExecutor, Storage,
};
use keystep_crypto::{EncryptionKeyPair, wrap::KEYPAIR_RANDOMNESS_SIZE};
use keystep_proto::{CryptoIdentity, DeviceUid, Envelope, Uid};

use crate::{
    identity_store::InMemoryIdentityStore, network::RecordingNetwork,
    oblivious::InMemoryObliviousChannels, sim_env::SimEnv, sim_server::SimServer,
};

/// Server URL of every simulated identity.
pub const SIM_SERVER_URL: &str = "https://server.keystep.test";

/// Rounds [`SimWorld::run_until_quiet`] runs before giving up.
pub const MAX_ROUNDS: usize = 1000;

/// One device holding exactly one owned identity.
pub struct SimDevice<S: Storage> {
    name: String,
    identity: CryptoIdentity,
    device: DeviceUid,
    executor: ProtocolExecutor<SimEnv, S>,
    identities: Arc<InMemoryIdentityStore>,
    channels: Arc<InMemoryObliviousChannels>,
    network: RecordingNetwork,
}

impl<S: Storage> SimDevice<S> {
    /// Label given at creation, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owned identity.
    pub fn identity(&self) -> &CryptoIdentity {
        &self.identity
    }

    /// Device uid.
    pub fn device_uid(&self) -> DeviceUid {
        self.device
    }

    /// Protocol executor of this device.
    pub fn executor(&self) -> &ProtocolExecutor<SimEnv, S> {
        &self.executor
    }

    /// Identity collaborator.
    pub fn identities(&self) -> &InMemoryIdentityStore {
        &self.identities
    }

    /// Oblivious channel collaborator.
    pub fn channels(&self) -> &InMemoryObliviousChannels {
        &self.channels
    }

    /// Network recorder.
    pub fn network(&self) -> &RecordingNetwork {
        &self.network
    }

    fn accepts(&self, envelope: &Envelope) -> bool {
        envelope.to_identity == self.identity
            && (envelope.to_devices.is_empty() || envelope.to_devices.contains(&self.device))
    }
}

/// Traffic processed by one [`SimWorld::run_until_quiet`] call.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Envelope outcomes, tagged with the receiving identity
    pub envelopes: Vec<(CryptoIdentity, EnvelopeOutcome)>,
    /// Server response outcomes, tagged with the asking identity
    pub responses: Vec<(CryptoIdentity, ProcessOutcome)>,
    /// Delivery rounds it took
    pub rounds: usize,
    /// False if traffic was still flowing after [`MAX_ROUNDS`]
    pub quiet: bool,
}

/// Simulated devices, their server, and the routing between them.
pub struct SimWorld<S: Storage = MemoryStorage> {
    env: SimEnv,
    server: SimServer,
    config: EngineConfig,
    devices: Vec<SimDevice<S>>,
}

impl SimWorld<MemoryStorage> {
    /// Add a device with in-memory storage.
    pub fn add_identity(&mut self, name: &str) -> CryptoIdentity {
        self.add_identity_with_storage(name, MemoryStorage::new())
    }
}

impl<S: Storage> SimWorld<S> {
    /// Empty world drawing all randomness from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_config(seed, EngineConfig::default())
    }

    /// Empty world whose executors use `config`.
    pub fn with_config(seed: u64, config: EngineConfig) -> Self {
        Self { env: SimEnv::with_seed(seed), server: SimServer::new(), config, devices: Vec::new() }
    }

    /// Add a device holding a fresh identity on `storage`.
    pub fn add_identity_with_storage(&mut self, name: &str, storage: S) -> CryptoIdentity {
        let keys = EncryptionKeyPair::generate(&self.env.random_array::<KEYPAIR_RANDOMNESS_SIZE>());
        let identity = CryptoIdentity::new(SIM_SERVER_URL, keys.public_key().to_bytes());
        let device = DeviceUid(self.env.random_uid());

        let identities = Arc::new(InMemoryIdentityStore::new());
        identities.add_owned_identity(identity.clone(), keys.private_key(), device);
        let channels = Arc::new(InMemoryObliviousChannels::new(device));
        let network = RecordingNetwork::new();
        let collaborators = network.collaborators(
            Arc::clone(&identities) as _,
            Some(Arc::clone(&channels) as _),
        );

        let executor =
            ProtocolExecutor::new(self.env.clone(), storage, collaborators, self.config.clone());
        self.server.register_device(&identity, device);

        tracing::debug!(name, identity = %identity, device = %device, "device added");
        self.devices.push(SimDevice {
            name: name.to_owned(),
            identity: identity.clone(),
            device,
            executor,
            identities,
            channels,
            network,
        });
        identity
    }

    /// Shared environment.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Shared server.
    pub fn server(&self) -> &SimServer {
        &self.server
    }

    /// Every device, in creation order.
    pub fn devices(&self) -> &[SimDevice<S>] {
        &self.devices
    }

    /// Device holding `identity`.
    pub fn device(&self, identity: &CryptoIdentity) -> Option<&SimDevice<S>> {
        self.devices.iter().find(|d| &d.identity == identity)
    }

    /// Make `a` and `b` contacts of each other, without devices.
    pub fn introduce(&self, a: &CryptoIdentity, b: &CryptoIdentity) -> Result<(), IdentityError> {
        self.require(a)?.identities.add_contact(a, b)?;
        self.require(b)?.identities.add_contact(b, a)
    }

    /// Start a protocol on the device of `owned`.
    pub fn start<P: ProtocolDefinition>(
        &self,
        owned: &CryptoIdentity,
        message: &P::Message,
    ) -> Result<(Uid, ProcessOutcome), EngineError> {
        self.require(owned)?.executor.start_protocol::<P>(owned, message)
    }

    /// Drain every envelope posted by every device.
    pub fn pending_envelopes(&self) -> Vec<Envelope> {
        self.devices.iter().flat_map(|d| d.network.take_envelopes()).collect()
    }

    /// Hand `envelope` to every device it is addressed to.
    ///
    /// Envelopes for identities outside the world are dropped.
    pub fn deliver(
        &self,
        envelope: &Envelope,
    ) -> Result<Vec<(CryptoIdentity, EnvelopeOutcome)>, EngineError> {
        let mut outcomes = Vec::new();
        for device in self.devices.iter().filter(|d| d.accepts(envelope)) {
            let outcome = device.executor.receive_envelope(envelope)?;
            tracing::trace!(to = device.name(), outcome = ?outcome, "envelope delivered");
            outcomes.push((device.identity.clone(), outcome));
        }
        Ok(outcomes)
    }

    /// Answer every posted server query and route the responses back.
    pub fn deliver_queries(&self) -> Result<Vec<(CryptoIdentity, ProcessOutcome)>, EngineError> {
        let mut outcomes = Vec::new();
        for device in &self.devices {
            for query in device.network.take_queries() {
                let response = self.server.answer(&query);
                let outcome = device.executor.receive_server_response(response)?;
                outcomes.push((device.identity.clone(), outcome));
            }
        }
        Ok(outcomes)
    }

    /// Deliver queries and envelopes in rounds until nothing is left.
    pub fn run_until_quiet(&self) -> Result<RunReport, EngineError> {
        let mut report = RunReport::default();

        while report.rounds < MAX_ROUNDS {
            let responses = self.deliver_queries()?;
            let envelopes = self.pending_envelopes();
            if responses.is_empty() && envelopes.is_empty() {
                report.quiet = true;
                return Ok(report);
            }

            report.rounds += 1;
            report.responses.extend(responses);
            for envelope in &envelopes {
                report.envelopes.extend(self.deliver(envelope)?);
            }
        }

        tracing::warn!(rounds = report.rounds, "world still busy");
        Ok(report)
    }

    /// Collaborators of the device holding `owned`, for building another
    /// executor over the same identity store and channels.
    pub fn collaborators(&self, owned: &CryptoIdentity) -> Result<Collaborators, IdentityError> {
        let device = self.require(owned)?;
        Ok(device.network.collaborators(
            Arc::clone(&device.identities) as _,
            Some(Arc::clone(&device.channels) as _),
        ))
    }

    fn require(&self, owned: &CryptoIdentity) -> Result<&SimDevice<S>, IdentityError> {
        self.device(owned).ok_or_else(|| IdentityError::UnknownOwnedIdentity(owned.clone()))
    }
}
