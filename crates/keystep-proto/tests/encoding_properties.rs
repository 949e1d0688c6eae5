//! Property tests for CBOR encoding of wire types.

use keystep_proto::{
    ChannelMessage, CryptoIdentity, DeviceUid, ProtocolId, ProtocolMessage, ProtocolOrigin,
    ServerResponse, ServerResponseKind, Uid, encoding,
};
use proptest::prelude::*;

fn arb_uid() -> impl Strategy<Value = Uid> {
    any::<[u8; 32]>().prop_map(Uid::from_bytes)
}

fn arb_identity() -> impl Strategy<Value = CryptoIdentity> {
    ("[a-z]{1,12}", any::<[u8; 32]>())
        .prop_map(|(host, key)| CryptoIdentity::new(format!("https://{host}.example"), key))
}

fn arb_protocol_id() -> impl Strategy<Value = ProtocolId> {
    prop::sample::select(ProtocolId::ALL.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_channel_messages_survive_encoding(
        protocol_id in arb_protocol_id(),
        instance_uid in arb_uid(),
        body in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let message = ChannelMessage::Protocol(ProtocolMessage { protocol_id, instance_uid, body });
        let bytes = encoding::encode(&message).unwrap();
        prop_assert_eq!(encoding::decode::<ChannelMessage>(&bytes).unwrap(), message);
    }

    #[test]
    fn prop_server_responses_keep_context(
        identity in arb_identity(),
        protocol_id in arb_protocol_id(),
        instance_uid in arb_uid(),
        context in prop::collection::vec(any::<u8>(), 0..64),
        devices in prop::collection::vec(arb_uid(), 0..4),
    ) {
        let response = ServerResponse {
            owned_identity: identity.clone(),
            origin: ProtocolOrigin { protocol_id, instance_uid },
            context: context.clone(),
            result: ServerResponseKind::DeviceDiscovery {
                identity,
                device_uids: devices.into_iter().map(DeviceUid).collect(),
            },
        };
        let bytes = encoding::encode(&response).unwrap();
        let decoded: ServerResponse = encoding::decode(&bytes).unwrap();
        prop_assert_eq!(&decoded.context, &context);
        prop_assert_eq!(decoded, response);
    }

    #[test]
    fn prop_truncated_messages_do_not_decode(
        instance_uid in arb_uid(),
        body in prop::collection::vec(any::<u8>(), 1..64),
        cut in 1usize..16,
    ) {
        let message = ChannelMessage::Protocol(ProtocolMessage {
            protocol_id: ProtocolId::DeviceDiscovery,
            instance_uid,
            body,
        });
        let bytes = encoding::encode(&message).unwrap();
        let cut = cut.min(bytes.len());
        prop_assert!(encoding::decode::<ChannelMessage>(&bytes[..bytes.len() - cut]).is_err());
    }
}
