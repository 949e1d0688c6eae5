//! Async runtime around the synchronous executor.
//!
//! One worker task per owned identity drains a bounded queue of jobs. Each
//! job runs the executor on the blocking pool, so a slow storage commit never
//! stalls the async scheduler. Identities progress independently; within an
//! identity, jobs run in submission order.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use keystep_proto::{CryptoIdentity, Envelope, ServerResponse, Uid};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    env::Environment,
    error::EngineError,
    protocol::{
        ProtocolDefinition,
        executor::{EnvelopeOutcome, ProcessOutcome, ProtocolExecutor},
    },
    storage::Storage,
};

type Job<E, S> = Box<dyn FnOnce(&ProtocolExecutor<E, S>) + Send>;

struct Workers<E: Environment, S: Storage> {
    queues: HashMap<CryptoIdentity, mpsc::Sender<Job<E, S>>>,
    handles: Vec<JoinHandle<()>>,
    closed: bool,
}

/// Per-identity job queues in front of a [`ProtocolExecutor`].
pub struct EngineRuntime<E: Environment, S: Storage> {
    executor: Arc<ProtocolExecutor<E, S>>,
    handle: Handle,
    workers: Mutex<Workers<E, S>>,
}

impl<E: Environment, S: Storage> EngineRuntime<E, S> {
    /// Spawn workers on `handle` as identities show up.
    pub fn new(executor: ProtocolExecutor<E, S>, handle: Handle) -> Self {
        Self {
            executor: Arc::new(executor),
            handle,
            workers: Mutex::new(Workers {
                queues: HashMap::new(),
                handles: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Shared executor, for reads that need no ordering.
    pub fn executor(&self) -> &Arc<ProtocolExecutor<E, S>> {
        &self.executor
    }

    /// Run `f` on the worker of `owned` and wait for its result.
    ///
    /// Waits for queue space when the worker is saturated.
    ///
    /// # Errors
    ///
    /// `RuntimeShutdown` once [`Self::shutdown`] was called or if the worker
    /// died; otherwise whatever `f` returns.
    pub async fn submit<T, F>(&self, owned: &CryptoIdentity, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&ProtocolExecutor<E, S>) -> Result<T, EngineError> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job<E, S> = Box::new(move |executor| {
            // The submitter may have given up waiting.
            let _ = result_tx.send(f(executor));
        });

        let queue = self.queue_for(owned)?;
        queue.send(job).await.map_err(|_| EngineError::RuntimeShutdown)?;
        result_rx.await.map_err(|_| EngineError::RuntimeShutdown)?
    }

    /// Open and process an inbound envelope on the recipient's worker.
    pub async fn receive_envelope(&self, envelope: Envelope) -> Result<EnvelopeOutcome, EngineError> {
        let owned = envelope.to_identity.clone();
        self.submit(&owned, move |executor| executor.receive_envelope(&envelope)).await
    }

    /// Route a server response on the asking identity's worker.
    pub async fn receive_server_response(
        &self,
        response: ServerResponse,
    ) -> Result<ProcessOutcome, EngineError> {
        let owned = response.owned_identity.clone();
        self.submit(&owned, move |executor| executor.receive_server_response(response)).await
    }

    /// Start an instance of `P` on the worker of `owned`.
    pub async fn start_protocol<P>(
        &self,
        owned: &CryptoIdentity,
        message: P::Message,
    ) -> Result<(Uid, ProcessOutcome), EngineError>
    where
        P: ProtocolDefinition,
        P::Message: 'static,
    {
        let for_job = owned.clone();
        self.submit(owned, move |executor| executor.start_protocol::<P>(&for_job, &message)).await
    }

    /// Replay pending messages of `owned`.
    pub async fn replay_pending(
        &self,
        owned: &CryptoIdentity,
    ) -> Result<Vec<ProcessOutcome>, EngineError> {
        let for_job = owned.clone();
        self.submit(owned, move |executor| executor.replay_pending(&for_job)).await
    }

    /// Delete every instance of `owned`, after jobs already queued for it.
    pub async fn delete_all_instances(&self, owned: &CryptoIdentity) -> Result<usize, EngineError> {
        let for_job = owned.clone();
        self.submit(owned, move |executor| executor.delete_all_instances(&for_job)).await
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn shutdown(&self) {
        let handles = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.closed = true;
            workers.queues.clear();
            std::mem::take(&mut workers.handles)
        };

        tracing::info!(workers = handles.len(), "engine runtime shutting down");
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "worker ended abnormally");
            }
        }
    }

    fn queue_for(&self, owned: &CryptoIdentity) -> Result<mpsc::Sender<Job<E, S>>, EngineError> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.closed {
            return Err(EngineError::RuntimeShutdown);
        }
        if let Some(queue) = workers.queues.get(owned) {
            return Ok(queue.clone());
        }

        let (tx, rx) = mpsc::channel(self.executor.config().worker_queue_capacity.max(1));
        let handle = self.handle.spawn(run_worker(Arc::clone(&self.executor), owned.clone(), rx));
        workers.handles.push(handle);
        workers.queues.insert(owned.clone(), tx.clone());
        tracing::debug!(owned = %owned, "worker started");
        Ok(tx)
    }
}

async fn run_worker<E: Environment, S: Storage>(
    executor: Arc<ProtocolExecutor<E, S>>,
    owned: CryptoIdentity,
    mut jobs: mpsc::Receiver<Job<E, S>>,
) {
    while let Some(job) = jobs.recv().await {
        let executor = Arc::clone(&executor);
        if let Err(err) = tokio::task::spawn_blocking(move || job(&executor)).await {
            tracing::error!(owned = %owned, error = %err, "protocol job panicked");
        }
    }
    tracing::debug!(owned = %owned, "worker stopped");
}
