//! Executor behavior under unexpected, duplicated and stale messages.

use bytes::Bytes;
use keystep_core::{
    DropReason, EnvelopeOutcome, IdentityDelegate, ProcessOutcome, Storage,
    channel::{ReceivedMessage, ReceivedPayload, ReceptionChannelInfo},
    protocols::{
        DeviceDiscovery, IdentityDetailsPublication,
        device_discovery::{DiscoveryMessage, DiscoveryState},
        identity_publication::{PublicationMessage, PublicationState},
    },
};
use keystep_harness::SimWorld;
use keystep_proto::{
    CryptoIdentity, DeviceUid, Envelope, MessageId, ProtocolId, ProtocolMessage, ProtocolOrigin,
    ServerResponse, ServerResponseKind, Uid, encoding,
};

fn message(
    owned: &CryptoIdentity,
    protocol_id: ProtocolId,
    instance_uid: Uid,
    body: Vec<u8>,
    reception: ReceptionChannelInfo,
    uid_byte: u8,
) -> ReceivedMessage {
    ReceivedMessage {
        message_id: MessageId {
            owned_identity: owned.clone(),
            uid: Uid::from_bytes([uid_byte; 32]),
        },
        reception,
        payload: ReceivedPayload::Protocol(ProtocolMessage { protocol_id, instance_uid, body }),
    }
}

fn publication_initial(version: u64) -> Vec<u8> {
    encoding::encode(&PublicationMessage::Initial { version }).unwrap()
}

fn connected_pair(seed: u64) -> (SimWorld, CryptoIdentity, CryptoIdentity) {
    let mut world = SimWorld::with_seed(seed);
    let alice = world.add_identity("alice");
    let bob = world.add_identity("bob");
    world.introduce(&alice, &bob).unwrap();
    world
        .start::<DeviceDiscovery>(&alice, &DiscoveryMessage::Initial { contact: bob.clone() })
        .unwrap();
    assert!(world.run_until_quiet().unwrap().quiet);
    (world, alice, bob)
}

#[test]
fn local_initial_on_oblivious_channel_is_dropped() {
    let mut world = SimWorld::with_seed(10);
    let alice = world.add_identity("alice");
    let bob = world.add_identity("bob");
    let identities = world.device(&alice).unwrap().identities();
    identities.publish_details(&alice, b"a".to_vec(), None).unwrap();

    let instance_uid = Uid::from_bytes([3; 32]);
    let forged = message(
        &alice,
        ProtocolId::IdentityDetailsPublication,
        instance_uid,
        publication_initial(1),
        ReceptionChannelInfo::ObliviousChannel {
            remote_identity: bob.clone(),
            remote_device: world.device(&bob).unwrap().device_uid(),
        },
        1,
    );

    let executor = world.device(&alice).unwrap().executor();
    let outcome = executor.process_received_message(forged).unwrap();
    assert_eq!(outcome, ProcessOutcome::Dropped(DropReason::ChannelExpectationMismatch));

    // Consumed, and the instance was never created.
    assert!(executor.storage().load_pending(&alice).unwrap().is_empty());
    assert!(
        !executor.is_finished(&alice, ProtocolId::IdentityDetailsPublication, instance_uid).unwrap()
    );
    assert!(executor.instances(&alice).unwrap().is_empty());
}

#[test]
fn details_on_local_channel_are_dropped() {
    let (world, alice, bob) = connected_pair(11);
    let details = PublicationMessage::Details {
        details: keystep_core::ContactDetails {
            version: 9,
            encoded_details: b"forged".to_vec(),
            photo_server_label: None,
            photo_key: None,
        },
    };
    let forged = message(
        &bob,
        ProtocolId::IdentityDetailsPublication,
        Uid::from_bytes([4; 32]),
        encoding::encode(&details).unwrap(),
        ReceptionChannelInfo::Local,
        2,
    );

    let bob_device = world.device(&bob).unwrap();
    let outcome = bob_device.executor().process_received_message(forged).unwrap();
    assert_eq!(outcome, ProcessOutcome::Dropped(DropReason::ChannelExpectationMismatch));
    assert_eq!(bob_device.identities().contact_published_version(&bob, &alice).unwrap(), None);
}

#[test]
fn duplicate_initial_after_completion_is_dropped() {
    let mut world = SimWorld::with_seed(12);
    let alice = world.add_identity("alice");
    let identities = world.device(&alice).unwrap().identities();
    let version = identities.publish_details(&alice, b"a".to_vec(), None).unwrap();

    let (instance_uid, outcome) = world
        .start::<IdentityDetailsPublication>(&alice, &PublicationMessage::Initial { version })
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Advanced { terminal: true, .. }));

    let duplicate = message(
        &alice,
        ProtocolId::IdentityDetailsPublication,
        instance_uid,
        publication_initial(version),
        ReceptionChannelInfo::Local,
        5,
    );
    let executor = world.device(&alice).unwrap().executor();
    assert_eq!(
        executor.process_received_message(duplicate).unwrap(),
        ProcessOutcome::Dropped(DropReason::InstanceFinished)
    );
}

#[test]
fn duplicate_initial_during_upload_matches_no_step() {
    let mut world = SimWorld::with_seed(13);
    let alice = world.add_identity("alice");
    let identities = world.device(&alice).unwrap().identities();
    let version = identities.publish_details(&alice, b"a".to_vec(), Some(vec![1, 2, 3])).unwrap();

    let (instance_uid, _) = world
        .start::<IdentityDetailsPublication>(&alice, &PublicationMessage::Initial { version })
        .unwrap();
    let executor = world.device(&alice).unwrap().executor();
    let before = executor.load_state::<IdentityDetailsPublication>(&alice, instance_uid).unwrap();
    assert!(matches!(before, Some(PublicationState::UploadingPhoto { .. })));

    let duplicate = message(
        &alice,
        ProtocolId::IdentityDetailsPublication,
        instance_uid,
        publication_initial(version),
        ReceptionChannelInfo::Local,
        6,
    );
    assert_eq!(
        executor.process_received_message(duplicate).unwrap(),
        ProcessOutcome::Dropped(DropReason::NoMatchingStep)
    );
    let after = executor.load_state::<IdentityDetailsPublication>(&alice, instance_uid).unwrap();
    assert_eq!(after, before);
}

#[test]
fn messages_for_unknown_or_inactive_identities_are_dropped() {
    let mut world = SimWorld::with_seed(14);
    let alice = world.add_identity("alice");
    let stranger = CryptoIdentity::new("https://server.keystep.test", [0xAB; 32]);
    let executor = world.device(&alice).unwrap().executor();

    let for_stranger = message(
        &stranger,
        ProtocolId::IdentityDetailsPublication,
        Uid::from_bytes([1; 32]),
        publication_initial(1),
        ReceptionChannelInfo::Local,
        7,
    );
    assert_eq!(
        executor.process_received_message(for_stranger).unwrap(),
        ProcessOutcome::Dropped(DropReason::UnknownOwnedIdentity)
    );

    world.device(&alice).unwrap().identities().set_active(&alice, false).unwrap();
    let for_inactive = message(
        &alice,
        ProtocolId::IdentityDetailsPublication,
        Uid::from_bytes([2; 32]),
        publication_initial(1),
        ReceptionChannelInfo::Local,
        8,
    );
    assert_eq!(
        executor.process_received_message(for_inactive).unwrap(),
        ProcessOutcome::Dropped(DropReason::InactiveOwnedIdentity)
    );
}

#[test]
fn undecodable_body_is_dropped() {
    let mut world = SimWorld::with_seed(15);
    let alice = world.add_identity("alice");
    let executor = world.device(&alice).unwrap().executor();

    let garbage = message(
        &alice,
        ProtocolId::DeviceDiscovery,
        Uid::from_bytes([1; 32]),
        vec![0xFF, 0x00, 0x13],
        ReceptionChannelInfo::Local,
        9,
    );
    assert_eq!(
        executor.process_received_message(garbage).unwrap(),
        ProcessOutcome::Dropped(DropReason::UndecodableMessage)
    );
    assert!(executor.storage().load_pending(&alice).unwrap().is_empty());
}

#[test]
fn unexpected_server_response_is_dropped() {
    let mut world = SimWorld::with_seed(16);
    let alice = world.add_identity("alice");
    let executor = world.device(&alice).unwrap().executor();

    let response = ServerResponse {
        owned_identity: alice.clone(),
        origin: ProtocolOrigin {
            protocol_id: ProtocolId::IdentityDetailsPublication,
            instance_uid: Uid::from_bytes([1; 32]),
        },
        context: Vec::new(),
        result: ServerResponseKind::GetUserData { data: None },
    };
    assert_eq!(
        executor.receive_server_response(response).unwrap(),
        ProcessOutcome::Dropped(DropReason::UnexpectedServerResponse)
    );
}

#[test]
fn stale_photo_upload_does_not_overwrite_newer_publication() {
    let (world, alice, bob) = connected_pair(17);
    let identities = world.device(&alice).unwrap().identities();

    identities.publish_details(&alice, b"older".to_vec(), Some(b"older photo".to_vec())).unwrap();
    let (first, _) = world
        .start::<IdentityDetailsPublication>(&alice, &PublicationMessage::Initial { version: 1 })
        .unwrap();
    identities.publish_details(&alice, b"newer".to_vec(), Some(b"newer photo".to_vec())).unwrap();
    let (second, _) = world
        .start::<IdentityDetailsPublication>(&alice, &PublicationMessage::Initial { version: 2 })
        .unwrap();

    let executor = world.device(&alice).unwrap().executor();
    let Some(PublicationState::UploadingPhoto { label: second_label, .. }) =
        executor.load_state::<IdentityDetailsPublication>(&alice, second).unwrap()
    else {
        panic!("second publication should be uploading its photo");
    };

    // Both uploads answer; the first belongs to a superseded version.
    let responses = world.deliver_queries().unwrap();
    assert!(matches!(
        responses.as_slice(),
        [
            (_, ProcessOutcome::Cancelled { .. }),
            (_, ProcessOutcome::Advanced { terminal: true, .. })
        ]
    ));
    assert!(executor.is_finished(&alice, ProtocolId::IdentityDetailsPublication, first).unwrap());

    world.run_until_quiet().unwrap();
    let published = identities.published_details(&alice).unwrap();
    assert_eq!(published.version, 2);
    assert_eq!(published.photo_server_label, Some(second_label));

    let received = world.device(&bob).unwrap().identities().contact_details(&bob, &alice).unwrap();
    let received = received.unwrap();
    assert_eq!(received.version, 2);
    assert_eq!(received.encoded_details, b"newer".to_vec());
    assert_eq!(received.photo_server_label, Some(second_label));
}

#[test]
fn failed_photo_upload_cancels_publication() {
    let mut world = SimWorld::with_seed(18);
    let alice = world.add_identity("alice");
    let identities = world.device(&alice).unwrap().identities();
    let version = identities.publish_details(&alice, b"a".to_vec(), Some(vec![7; 16])).unwrap();
    world.server().fail_queries(true);

    let (instance_uid, _) = world
        .start::<IdentityDetailsPublication>(&alice, &PublicationMessage::Initial { version })
        .unwrap();
    let report = world.run_until_quiet().unwrap();

    assert!(matches!(report.responses.as_slice(), [(_, ProcessOutcome::Cancelled { .. })]));
    let executor = world.device(&alice).unwrap().executor();
    assert!(executor.is_finished(&alice, ProtocolId::IdentityDetailsPublication, instance_uid).unwrap());
    assert_eq!(identities.published_details(&alice).unwrap().photo_server_label, None);
}

#[test]
fn delete_all_instances_forgets_live_and_finished_instances() {
    let mut world = SimWorld::with_seed(19);
    let alice = world.add_identity("alice");
    let identities = world.device(&alice).unwrap().identities();
    let version = identities.publish_details(&alice, b"a".to_vec(), Some(vec![1])).unwrap();

    let (uploading, _) = world
        .start::<IdentityDetailsPublication>(&alice, &PublicationMessage::Initial { version })
        .unwrap();
    let (cancelled, _) = world
        .start::<IdentityDetailsPublication>(&alice, &PublicationMessage::Initial { version: 99 })
        .unwrap();

    let executor = world.device(&alice).unwrap().executor();
    let summaries = executor.instances(&alice).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].key.instance_uid, uploading);
    assert_eq!(summaries[0].state.as_deref(), Some("UploadingPhoto"));
    assert!(executor.is_finished(&alice, ProtocolId::IdentityDetailsPublication, cancelled).unwrap());

    assert_eq!(executor.delete_all_instances(&alice).unwrap(), 1);
    assert!(executor.instances(&alice).unwrap().is_empty());
    assert!(!executor.is_finished(&alice, ProtocolId::IdentityDetailsPublication, cancelled).unwrap());
}

#[test]
fn device_uid_for_unknown_contact_is_not_recorded() {
    let mut world = SimWorld::with_seed(20);
    let alice = world.add_identity("alice");
    let bob = world.add_identity("bob");
    world.introduce(&alice, &bob).unwrap();

    let (instance_uid, _) = world
        .start::<DeviceDiscovery>(&alice, &DiscoveryMessage::Initial { contact: bob.clone() })
        .unwrap();

    // The server answers for a different identity than the one asked about.
    let stranger = CryptoIdentity::new("https://server.keystep.test", [0xCD; 32]);
    let response = ServerResponse {
        owned_identity: alice.clone(),
        origin: ProtocolOrigin { protocol_id: ProtocolId::DeviceDiscovery, instance_uid },
        context: Vec::new(),
        result: ServerResponseKind::DeviceDiscovery {
            identity: stranger,
            device_uids: vec![DeviceUid(Uid::from_bytes([1; 32]))],
        },
    };
    let device = world.device(&alice).unwrap();
    assert!(matches!(
        device.executor().receive_server_response(response).unwrap(),
        ProcessOutcome::Cancelled { .. }
    ));
    assert!(device.identities().contact_device_uids(&alice, &bob).unwrap().is_empty());
}

#[test]
fn envelope_for_an_identity_we_do_not_own_is_undecryptable() {
    let mut world = SimWorld::with_seed(20);
    let alice = world.add_identity("alice");
    let stranger = CryptoIdentity::new("https://server.example", [9; 32]);

    let envelope = Envelope {
        message_uid: Uid::from_bytes([5; 32]),
        to_identity: stranger.clone(),
        to_devices: Vec::new(),
        wrapped_key: vec![0x01, 1, 2, 3, 4],
        encrypted_content: Bytes::from_static(b"not for us"),
    };

    let executor = world.device(&alice).unwrap().executor();
    let outcome = executor.receive_envelope(&envelope).unwrap();
    assert_eq!(
        outcome,
        EnvelopeOutcome::Undecryptable {
            message_id: MessageId { owned_identity: stranger, uid: envelope.message_uid },
        }
    );
    assert!(executor.instances(&alice).unwrap().is_empty());
}

#[test]
fn concurrent_copies_of_one_message_advance_the_instance_once() {
    const COPIES: u8 = 8;

    let mut world = SimWorld::with_seed(21);
    let alice = world.add_identity("alice");
    let bob = world.add_identity("bob");
    world.introduce(&alice, &bob).unwrap();

    let instance_uid = Uid::from_bytes([6; 32]);
    let body = encoding::encode(&DiscoveryMessage::Initial { contact: bob.clone() }).unwrap();
    let device = world.device(&alice).unwrap();
    let executor = device.executor();

    let outcomes: Vec<ProcessOutcome> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..COPIES)
            .map(|copy| {
                let copy_message = message(
                    &alice,
                    ProtocolId::DeviceDiscovery,
                    instance_uid,
                    body.clone(),
                    ReceptionChannelInfo::Local,
                    100 + copy,
                );
                scope.spawn(move || executor.process_received_message(copy_message).unwrap())
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let advanced =
        outcomes.iter().filter(|o| matches!(o, ProcessOutcome::Advanced { .. })).count();
    let dropped = outcomes
        .iter()
        .filter(|o| **o == ProcessOutcome::Dropped(DropReason::NoMatchingStep))
        .count();
    assert_eq!(advanced, 1);
    assert_eq!(dropped, usize::from(COPIES) - 1);

    assert_eq!(device.network().take_queries().len(), 1);
    assert_eq!(
        executor.load_state::<DeviceDiscovery>(&alice, instance_uid).unwrap(),
        Some(DiscoveryState::WaitingForServerResponse { contact: bob })
    );
    assert!(executor.storage().load_pending(&alice).unwrap().is_empty());
}
