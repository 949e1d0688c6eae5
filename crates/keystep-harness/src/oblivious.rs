//! In-memory oblivious channels.
//!
//! A channel is two [`KeyRatchet`] chains derived from the seed both ends
//! agreed on. The endpoint that sorts lower sends on the low-to-high chain
//! and receives on the other one. A wrapped message key is laid out as:
//!
//! ```text
//! chain id (16) ‖ counter (u32 BE) ‖ seal(chain key, message key)
//! ```
//!
//! Advancing the send chain is not part of any unit of work; a rolled back
//! step just leaves a gap the receiver skips over.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use keystep_core::{ChannelError, ObliviousChannelDelegate, UnitOfWork};
use keystep_crypto::{
    AuthenticatedEncryptionKey, ChainDirection, KeyRatchet, aead,
    ratchet::{self, CHAIN_ID_SIZE},
};
use keystep_proto::{CryptoIdentity, DeviceUid};

const COUNTER_SIZE: usize = 4;

struct ChannelRecord {
    remote: CryptoIdentity,
    remote_device: DeviceUid,
    send: KeyRatchet,
    receive: KeyRatchet,
}

type Channels = HashMap<CryptoIdentity, Vec<ChannelRecord>>;

/// Confirmed channels of one simulated device.
#[derive(Clone)]
pub struct InMemoryObliviousChannels {
    device: DeviceUid,
    inner: Arc<Mutex<Channels>>,
}

impl InMemoryObliviousChannels {
    /// Channels for the device `device`.
    pub fn new(device: DeviceUid) -> Self {
        Self { device, inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Number of confirmed channels of `owned`.
    pub fn channel_count(&self, owned: &CryptoIdentity) -> usize {
        lock(&self.inner).get(owned).map_or(0, Vec::len)
    }

    /// Remote endpoints of every confirmed channel of `owned`.
    pub fn endpoints(&self, owned: &CryptoIdentity) -> Vec<(CryptoIdentity, DeviceUid)> {
        lock(&self.inner)
            .get(owned)
            .map(|records| records.iter().map(|r| (r.remote.clone(), r.remote_device)).collect())
            .unwrap_or_default()
    }

    fn install(
        inner: &Mutex<Channels>,
        local: (&CryptoIdentity, DeviceUid),
        remote: (CryptoIdentity, DeviceUid),
        seed: &[u8; 32],
    ) {
        let (send_direction, receive_direction) = if local < (&remote.0, remote.1) {
            (ChainDirection::LowToHigh, ChainDirection::HighToLow)
        } else {
            (ChainDirection::HighToLow, ChainDirection::LowToHigh)
        };

        let record = ChannelRecord {
            send: KeyRatchet::new(&ratchet::chain_seed(seed, send_direction)),
            receive: KeyRatchet::new(&ratchet::chain_seed(seed, receive_direction)),
            remote: remote.0,
            remote_device: remote.1,
        };

        let mut channels = lock(inner);
        let records = channels.entry(local.0.clone()).or_default();
        records.retain(|r| !(r.remote == record.remote && r.remote_device == record.remote_device));
        records.push(record);
    }
}

impl ObliviousChannelDelegate for InMemoryObliviousChannels {
    fn confirmed_channel_devices(
        &self,
        owned: &CryptoIdentity,
        remote: &CryptoIdentity,
    ) -> Result<Vec<DeviceUid>, ChannelError> {
        Ok(lock(&self.inner)
            .get(owned)
            .map(|records| {
                records.iter().filter(|r| &r.remote == remote).map(|r| r.remote_device).collect()
            })
            .unwrap_or_default())
    }

    fn wrap_message_key(
        &self,
        owned: &CryptoIdentity,
        remote: &CryptoIdentity,
        remote_device: DeviceUid,
        key: &AuthenticatedEncryptionKey,
    ) -> Option<Vec<u8>> {
        let mut channels = lock(&self.inner);
        let record = channels
            .get_mut(owned)?
            .iter_mut()
            .find(|r| &r.remote == remote && r.remote_device == remote_device)?;

        let (counter, chain_key) = match record.send.next_key() {
            Ok(next) => next,
            Err(err) => {
                tracing::warn!(remote = %remote, error = %err, "send chain exhausted");
                return None;
            },
        };

        let mut wrapped = Vec::with_capacity(CHAIN_ID_SIZE + COUNTER_SIZE + 32 + aead::SEAL_OVERHEAD);
        wrapped.extend_from_slice(&record.send.chain_id());
        wrapped.extend_from_slice(&counter.to_be_bytes());
        // Each chain key seals exactly one message key.
        wrapped.extend_from_slice(&aead::seal(&chain_key, key.as_bytes(), [0; aead::NONCE_SIZE]));
        Some(wrapped)
    }

    fn unwrap_message_key(
        &self,
        owned: &CryptoIdentity,
        wrapped: &[u8],
    ) -> Option<(AuthenticatedEncryptionKey, CryptoIdentity, DeviceUid)> {
        if wrapped.len() < CHAIN_ID_SIZE + COUNTER_SIZE {
            return None;
        }
        let (chain_id, rest) = wrapped.split_at(CHAIN_ID_SIZE);
        let (counter, sealed) = rest.split_at(COUNTER_SIZE);
        let counter = u32::from_be_bytes(counter.try_into().ok()?);

        let mut channels = lock(&self.inner);
        let record =
            channels.get_mut(owned)?.iter_mut().find(|r| r.receive.chain_id() == chain_id)?;

        let chain_key = match record.receive.key_at(counter) {
            Ok(key) => key,
            Err(err) => {
                tracing::debug!(counter, error = %err, "no receive key for counter");
                return None;
            },
        };
        let opened = aead::open(&chain_key, sealed).ok()?;
        let key_bytes: [u8; 32] = opened.as_slice().try_into().ok()?;

        Some((
            AuthenticatedEncryptionKey::from_bytes(key_bytes),
            record.remote.clone(),
            record.remote_device,
        ))
    }

    fn create_channel(
        &self,
        uow: &mut UnitOfWork,
        owned: &CryptoIdentity,
        remote: &CryptoIdentity,
        remote_device: DeviceUid,
        seed: [u8; 32],
    ) -> Result<(), ChannelError> {
        let inner = Arc::clone(&self.inner);
        let device = self.device;
        let owned = owned.clone();
        let remote = remote.clone();
        uow.defer(move || {
            Self::install(&inner, (&owned, device), (remote, remote_device), &seed);
        });
        Ok(())
    }
}

fn lock(inner: &Mutex<Channels>) -> MutexGuard<'_, Channels> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use keystep_proto::Uid;

    use super::*;

    fn endpoint(byte: u8) -> (CryptoIdentity, DeviceUid, InMemoryObliviousChannels) {
        let device = DeviceUid(Uid::from_bytes([byte; 32]));
        (
            CryptoIdentity::new("https://server.keystep.test", [byte; 32]),
            device,
            InMemoryObliviousChannels::new(device),
        )
    }

    fn connect(
        a: &(CryptoIdentity, DeviceUid, InMemoryObliviousChannels),
        b: &(CryptoIdentity, DeviceUid, InMemoryObliviousChannels),
    ) {
        let seed = [7; 32];
        let mut uow = UnitOfWork::new(a.0.clone());
        a.2.create_channel(&mut uow, &a.0, &b.0, b.1, seed).unwrap();
        let mut other = UnitOfWork::new(b.0.clone());
        b.2.create_channel(&mut other, &b.0, &a.0, a.1, seed).unwrap();

        let storage = keystep_core::MemoryStorage::new();
        let collaborators = crate::network::RecordingNetwork::new().collaborators(
            Arc::new(crate::InMemoryIdentityStore::new()),
            None,
        );
        uow.commit(&storage, &collaborators).unwrap();
        other.commit(&storage, &collaborators).unwrap();
    }

    #[test]
    fn keys_cross_in_both_directions() {
        let alice = endpoint(1);
        let bob = endpoint(2);
        connect(&alice, &bob);

        let key = AuthenticatedEncryptionKey::from_bytes([42; 32]);
        let wrapped = alice.2.wrap_message_key(&alice.0, &bob.0, bob.1, &key).unwrap();
        let (unwrapped, sender, sender_device) = bob.2.unwrap_message_key(&bob.0, &wrapped).unwrap();
        assert_eq!(unwrapped.as_bytes(), key.as_bytes());
        assert_eq!(sender, alice.0);
        assert_eq!(sender_device, alice.1);

        let reply = bob.2.wrap_message_key(&bob.0, &alice.0, alice.1, &key).unwrap();
        assert!(alice.2.unwrap_message_key(&alice.0, &reply).is_some());
    }

    #[test]
    fn own_wrap_does_not_unwrap_locally() {
        let alice = endpoint(1);
        let bob = endpoint(2);
        connect(&alice, &bob);

        let key = AuthenticatedEncryptionKey::from_bytes([1; 32]);
        let wrapped = alice.2.wrap_message_key(&alice.0, &bob.0, bob.1, &key).unwrap();
        assert!(alice.2.unwrap_message_key(&alice.0, &wrapped).is_none());
    }

    #[test]
    fn reordered_keys_unwrap_once() {
        let alice = endpoint(1);
        let bob = endpoint(2);
        connect(&alice, &bob);

        let key = AuthenticatedEncryptionKey::from_bytes([3; 32]);
        let first = alice.2.wrap_message_key(&alice.0, &bob.0, bob.1, &key).unwrap();
        let second = alice.2.wrap_message_key(&alice.0, &bob.0, bob.1, &key).unwrap();

        assert!(bob.2.unwrap_message_key(&bob.0, &second).is_some());
        assert!(bob.2.unwrap_message_key(&bob.0, &first).is_some());
        assert!(bob.2.unwrap_message_key(&bob.0, &first).is_none());
    }

    #[test]
    fn channel_exists_only_after_commit() {
        let alice = endpoint(1);
        let bob = endpoint(2);

        let mut uow = UnitOfWork::new(alice.0.clone());
        alice.2.create_channel(&mut uow, &alice.0, &bob.0, bob.1, [9; 32]).unwrap();
        assert_eq!(alice.2.channel_count(&alice.0), 0);
        drop(uow);
        assert_eq!(alice.2.channel_count(&alice.0), 0);
    }
}
