//! Network collaborators that record instead of sending.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use keystep_core::{
    Collaborators, IdentityDelegate, NetworkFetchDelegate, NetworkSendDelegate,
    ObliviousChannelDelegate,
};
use keystep_proto::{Envelope, ServerQuery};

/// Outbound envelopes and server queries of one device, in post order.
#[derive(Clone, Default)]
pub struct RecordingNetwork {
    envelopes: Arc<Mutex<VecDeque<Envelope>>>,
    queries: Arc<Mutex<VecDeque<ServerQuery>>>,
}

impl RecordingNetwork {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain every envelope posted so far.
    pub fn take_envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect()
    }

    /// Drain every server query posted so far.
    pub fn take_queries(&self) -> Vec<ServerQuery> {
        self.queries.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect()
    }

    /// Envelopes waiting to be taken.
    pub fn envelope_count(&self) -> usize {
        self.envelopes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Bind this recorder as both network collaborators.
    pub fn collaborators(
        &self,
        identity: Arc<dyn IdentityDelegate>,
        oblivious: Option<Arc<dyn ObliviousChannelDelegate>>,
    ) -> Collaborators {
        Collaborators {
            identity,
            network_fetch: Arc::new(self.clone()),
            network_send: Arc::new(self.clone()),
            oblivious,
        }
    }
}

impl NetworkSendDelegate for RecordingNetwork {
    fn post_envelope(&self, envelope: Envelope) {
        tracing::trace!(message_uid = %envelope.message_uid, "envelope recorded");
        self.envelopes.lock().unwrap_or_else(PoisonError::into_inner).push_back(envelope);
    }
}

impl NetworkFetchDelegate for RecordingNetwork {
    fn post_server_query(&self, query: ServerQuery) {
        tracing::trace!(protocol = %query.origin.protocol_id, "server query recorded");
        self.queries.lock().unwrap_or_else(PoisonError::into_inner).push_back(query);
    }
}
