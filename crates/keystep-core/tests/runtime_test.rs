//! Per-identity workers of the async runtime.

use std::sync::Arc;

use keystep_core::{
    EngineConfig, EngineError, EngineRuntime, Environment, MemoryStorage, ProcessOutcome,
    ProtocolExecutor,
    protocols::{IdentityDetailsPublication, identity_publication::PublicationMessage},
};
use keystep_crypto::{EncryptionKeyPair, wrap::KEYPAIR_RANDOMNESS_SIZE};
use keystep_harness::{InMemoryIdentityStore, RecordingNetwork, SIM_SERVER_URL, SimEnv};
use keystep_proto::{CryptoIdentity, DeviceUid, ProtocolId};

struct Fixture {
    runtime: EngineRuntime<SimEnv, MemoryStorage>,
    identities: Arc<InMemoryIdentityStore>,
    owned: Vec<CryptoIdentity>,
}

fn fixture(identity_count: usize) -> Fixture {
    let env = SimEnv::with_seed(40);
    let identities = Arc::new(InMemoryIdentityStore::new());
    let device = DeviceUid(env.random_uid());

    let owned = (0..identity_count)
        .map(|_| {
            let keys = EncryptionKeyPair::generate(&env.random_array::<KEYPAIR_RANDOMNESS_SIZE>());
            let identity = CryptoIdentity::new(SIM_SERVER_URL, keys.public_key().to_bytes());
            identities.add_owned_identity(identity.clone(), keys.private_key(), device);
            identity
        })
        .collect();

    let collaborators = RecordingNetwork::new().collaborators(Arc::clone(&identities) as _, None);
    let executor =
        ProtocolExecutor::new(env, MemoryStorage::new(), collaborators, EngineConfig::default());
    Fixture {
        runtime: EngineRuntime::new(executor, tokio::runtime::Handle::current()),
        identities,
        owned,
    }
}

#[tokio::test]
async fn every_identity_gets_its_own_worker() {
    let fixture = fixture(3);
    for owned in &fixture.owned {
        fixture.identities.publish_details(owned, b"details".to_vec(), None).unwrap();
        let (_, outcome) = fixture
            .runtime
            .start_protocol::<IdentityDetailsPublication>(
                owned,
                PublicationMessage::Initial { version: 1 },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Advanced { terminal: true, .. }));
    }

    assert_eq!(fixture.runtime.executor().storage().instance_count().unwrap(), 0);
    fixture.runtime.shutdown().await;
}

#[tokio::test]
async fn submitted_jobs_see_earlier_jobs_of_the_identity() {
    let fixture = fixture(1);
    let owned = fixture.owned[0].clone();
    fixture.identities.publish_details(&owned, b"one".to_vec(), None).unwrap();

    let start = fixture.runtime.start_protocol::<IdentityDetailsPublication>(
        &owned,
        PublicationMessage::Initial { version: 1 },
    );
    let (instance_uid, _) = start.await.unwrap();

    let for_job = owned.clone();
    let is_finished = fixture
        .runtime
        .submit(&owned, move |executor| {
            Ok(executor.is_finished(&for_job, ProtocolId::IdentityDetailsPublication, instance_uid)?)
        })
        .await
        .unwrap();
    assert!(is_finished);

    let removed = fixture.runtime.delete_all_instances(&owned).await.unwrap();
    assert_eq!(removed, 0);
    fixture.runtime.shutdown().await;
}

#[tokio::test]
async fn shutdown_rejects_new_jobs() {
    let fixture = fixture(1);
    let owned = fixture.owned[0].clone();
    fixture.runtime.shutdown().await;

    let result = fixture.runtime.delete_all_instances(&owned).await;
    assert!(matches!(result, Err(EngineError::RuntimeShutdown)));
}
