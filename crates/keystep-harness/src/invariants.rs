//! Properties that must hold for a simulated world once traffic stops.
//!
//! A [`WorldSnapshot`] extracts the observable state of every device. Each
//! [`Invariant`] then checks one property against it, independent of the
//! scenario that produced it.
//!
//! ```ignore
//! world.run_until_quiet()?;
//! let snapshot = WorldSnapshot::capture(&world)?;
//! InvariantRegistry::quiescent().check_all(&snapshot)?;
//! ```

use std::{collections::BTreeMap, fmt};

use keystep_core::{EngineError, IdentityDelegate, InstanceSummary, Storage};
use keystep_proto::{CryptoIdentity, DeviceUid};

use crate::world::SimWorld;

/// Observable state of one device.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    /// Owned identity
    pub identity: CryptoIdentity,
    /// Device uid
    pub device: DeviceUid,
    /// Version of the details this identity published
    pub published_version: u64,
    /// Last details version received from each contact
    pub contact_versions: BTreeMap<CryptoIdentity, Option<u64>>,
    /// Remote endpoints of every confirmed channel
    pub channels: Vec<(CryptoIdentity, DeviceUid)>,
    /// Messages received but not yet consumed
    pub pending: usize,
    /// Live protocol instances
    pub instances: Vec<InstanceSummary>,
}

/// Observable state of a whole world.
#[derive(Debug, Clone, Default)]
pub struct WorldSnapshot {
    /// One entry per device, in creation order
    pub devices: Vec<DeviceSnapshot>,
}

impl WorldSnapshot {
    /// Read every device of `world`.
    pub fn capture<S: Storage>(world: &SimWorld<S>) -> Result<Self, EngineError> {
        let mut devices = Vec::with_capacity(world.devices().len());
        for device in world.devices() {
            let owned = device.identity();
            let identities = device.identities();

            let mut contact_versions = BTreeMap::new();
            for contact in identities.contacts(owned)? {
                let version = identities.contact_published_version(owned, &contact)?;
                contact_versions.insert(contact, version);
            }

            devices.push(DeviceSnapshot {
                identity: owned.clone(),
                device: device.device_uid(),
                published_version: identities.published_details(owned)?.version,
                contact_versions,
                channels: device.channels().endpoints(owned),
                pending: device.executor().storage().load_pending(owned)?.len(),
                instances: device.executor().instances(owned)?,
            });
        }
        Ok(Self { devices })
    }

    fn find(&self, identity: &CryptoIdentity, device: DeviceUid) -> Option<&DeviceSnapshot> {
        self.devices.iter().find(|d| &d.identity == identity && d.device == device)
    }
}

/// A violated invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Invariant name
    pub invariant: &'static str,
    /// What was observed
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// Result of one check.
pub type InvariantResult = Result<(), Violation>;

/// A property of a world snapshot.
pub trait Invariant: Send + Sync {
    /// Name used in violations.
    fn name(&self) -> &'static str;

    /// Check the property.
    fn check(&self, snapshot: &WorldSnapshot) -> InvariantResult;
}

/// Every confirmed channel is confirmed at both ends.
pub struct ChannelSymmetry;

impl Invariant for ChannelSymmetry {
    fn name(&self) -> &'static str {
        "channel_symmetry"
    }

    fn check(&self, snapshot: &WorldSnapshot) -> InvariantResult {
        for local in &snapshot.devices {
            for (remote, remote_device) in &local.channels {
                let Some(peer) = snapshot.find(remote, *remote_device) else {
                    continue;
                };
                if !peer.channels.contains(&(local.identity.clone(), local.device)) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "{} has a channel to {} that is not confirmed back",
                            local.device, peer.device
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// No device holds a received message it has not consumed.
pub struct NothingPending;

impl Invariant for NothingPending {
    fn name(&self) -> &'static str {
        "nothing_pending"
    }

    fn check(&self, snapshot: &WorldSnapshot) -> InvariantResult {
        match snapshot.devices.iter().find(|d| d.pending > 0) {
            Some(device) => Err(Violation {
                invariant: self.name(),
                message: format!("{} still has {} pending messages", device.device, device.pending),
            }),
            None => Ok(()),
        }
    }
}

/// Details received from a contact never claim a version the contact did not
/// publish.
pub struct DetailsNotAhead;

impl Invariant for DetailsNotAhead {
    fn name(&self) -> &'static str {
        "details_not_ahead"
    }

    fn check(&self, snapshot: &WorldSnapshot) -> InvariantResult {
        for local in &snapshot.devices {
            for (contact, version) in &local.contact_versions {
                let Some(version) = version else {
                    continue;
                };
                let published = snapshot
                    .devices
                    .iter()
                    .filter(|d| &d.identity == contact)
                    .map(|d| d.published_version)
                    .max();
                if let Some(published) = published
                    && *version > published
                {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "{} holds version {version} of {contact}, which published {published}",
                            local.identity
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A set of invariants checked together.
#[derive(Default)]
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything that must hold once [`SimWorld::run_until_quiet`] returned
    /// a quiet report.
    pub fn quiescent() -> Self {
        let mut registry = Self::new();
        registry.add(ChannelSymmetry);
        registry.add(NothingPending);
        registry.add(DetailsNotAhead);
        registry
    }

    /// Register `invariant`.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Run every check and collect all violations.
    pub fn check_all(&self, snapshot: &WorldSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(snapshot).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}
