//! Scripted identity server.
//!
//! Answers the queries the built-in protocols post: device discovery and
//! user data. Group blobs and transfer sessions are answered with `Failed`.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use keystep_proto::{
    CryptoIdentity, DeviceUid, ServerQuery, ServerQueryKind, ServerResponse, ServerResponseKind,
    Uid,
};

#[derive(Default)]
struct ServerState {
    devices: HashMap<CryptoIdentity, BTreeSet<DeviceUid>>,
    user_data: HashMap<(CryptoIdentity, Uid), Vec<u8>>,
    failing: bool,
    answered: usize,
}

/// In-memory server shared by every device of a simulated world.
#[derive(Clone, Default)]
pub struct SimServer {
    state: Arc<Mutex<ServerState>>,
}

impl SimServer {
    /// Empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `device` belongs to `identity`.
    pub fn register_device(&self, identity: &CryptoIdentity, device: DeviceUid) {
        self.lock().devices.entry(identity.clone()).or_default().insert(device);
    }

    /// Answer every following query with `Failed` while `failing` holds.
    pub fn fail_queries(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Stored user data, if any.
    pub fn user_data(&self, identity: &CryptoIdentity, label: &Uid) -> Option<Vec<u8>> {
        self.lock().user_data.get(&(identity.clone(), *label)).cloned()
    }

    /// Queries answered so far, failures included.
    pub fn answered(&self) -> usize {
        self.lock().answered
    }

    /// Answer one query. Origin and context are echoed.
    pub fn answer(&self, query: &ServerQuery) -> ServerResponse {
        let mut state = self.lock();
        state.answered += 1;

        if state.failing {
            return query.respond(ServerResponseKind::Failed { reason: "server unavailable".into() });
        }

        let result = match &query.kind {
            ServerQueryKind::DeviceDiscovery { identity } => ServerResponseKind::DeviceDiscovery {
                identity: identity.clone(),
                device_uids: devices_of(&state, identity),
            },
            ServerQueryKind::OwnedDeviceDiscovery => ServerResponseKind::OwnedDeviceDiscovery {
                device_uids: devices_of(&state, &query.owned_identity),
            },
            ServerQueryKind::PutUserData { label, data } => {
                state.user_data.insert((query.owned_identity.clone(), *label), data.clone());
                ServerResponseKind::PutUserData { label: *label }
            },
            ServerQueryKind::GetUserData { identity, label } => ServerResponseKind::GetUserData {
                data: state.user_data.get(&(identity.clone(), *label)).cloned(),
            },
            other => {
                tracing::debug!(query = ?other, "query not supported by simulated server");
                ServerResponseKind::Failed { reason: "unsupported".into() }
            },
        };

        query.respond(result)
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn devices_of(state: &ServerState, identity: &CryptoIdentity) -> Vec<DeviceUid> {
    state.devices.get(identity).map(|d| d.iter().copied().collect()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use keystep_proto::{ProtocolId, ProtocolOrigin};

    use super::*;

    fn query(owned: &CryptoIdentity, kind: ServerQueryKind) -> ServerQuery {
        ServerQuery {
            owned_identity: owned.clone(),
            origin: ProtocolOrigin {
                protocol_id: ProtocolId::DeviceDiscovery,
                instance_uid: Uid::from_bytes([1; 32]),
            },
            kind,
            context: vec![7],
        }
    }

    #[test]
    fn discovery_lists_registered_devices() {
        let server = SimServer::new();
        let alice = CryptoIdentity::new("https://server.keystep.test", [1; 32]);
        let bob = CryptoIdentity::new("https://server.keystep.test", [2; 32]);
        let device = DeviceUid(Uid::from_bytes([5; 32]));
        server.register_device(&bob, device);

        let response =
            server.answer(&query(&alice, ServerQueryKind::DeviceDiscovery { identity: bob.clone() }));
        assert_eq!(
            response.result,
            ServerResponseKind::DeviceDiscovery { identity: bob, device_uids: vec![device] }
        );
        assert_eq!(response.context, vec![7]);
    }

    #[test]
    fn user_data_round_trips_through_labels() {
        let server = SimServer::new();
        let alice = CryptoIdentity::new("https://server.keystep.test", [1; 32]);
        let label = Uid::from_bytes([4; 32]);

        server.answer(&query(&alice, ServerQueryKind::PutUserData { label, data: vec![1, 2] }));
        let response = server
            .answer(&query(&alice, ServerQueryKind::GetUserData { identity: alice.clone(), label }));
        assert_eq!(response.result, ServerResponseKind::GetUserData { data: Some(vec![1, 2]) });
    }

    #[test]
    fn failing_mode_fails_everything() {
        let server = SimServer::new();
        let alice = CryptoIdentity::new("https://server.keystep.test", [1; 32]);
        server.fail_queries(true);

        let response = server.answer(&query(&alice, ServerQueryKind::OwnedDeviceDiscovery));
        assert!(matches!(response.result, ServerResponseKind::Failed { .. }));
        assert_eq!(server.answered(), 1);
    }
}
