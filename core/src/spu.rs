//! Subscription Processing Unit: one per distinct subscription fingerprint.
//!
//! An SPU owns the last result set observed for its predicate and the worker
//! task that re-evaluates it under the post-update barrier. It talks back to
//! the manager exclusively through the narrow [`SpuHost`] capability, so the
//! registry can own the SPU without a reference cycle.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use sepa_proto::{BindingSet, Notification, NotificationEvent, QueryRequest, SpuId, SubscribeRequest, TerminationReason, UpdateResponse};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{
    endpoint::{PreparedUpdate, SparqlEndpoint},
    error::EndpointError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpuState {
    Initializing,
    Idle,
    PreProcessing,
    AwaitingEndpoint,
    PostProcessing,
    Terminating,
    Dead,
}

/// What the manager hands a worker per barrier phase.
pub(crate) enum SpuJob {
    PreUpdate(Arc<PreparedUpdate>),
    PostUpdate(UpdateOutcome),
    Finish,
}

/// The endpoint's verdict on the mutation, shared across the whole pool.
pub(crate) type UpdateOutcome = Arc<Result<UpdateResponse, EndpointError>>;

/// The only view of the manager an SPU ever holds: barrier acknowledgement
/// and the notification ingress.
pub(crate) trait SpuHost: Send + Sync {
    fn end_of_processing(&self, spuid: SpuId);
    fn exception_on_processing(&self, spuid: SpuId);
    fn notify_event(&self, notification: Notification);
}

/// Hook invoked under the pre-update barrier with the yet-to-be-applied
/// update. An implementation may inspect it to decide locally that the
/// predicate cannot be affected (e.g. by static analysis of the update's
/// graph footprint); the naive policy acknowledges unconditionally.
#[async_trait]
pub trait PreUpdatePolicy: Send + Sync + 'static {
    async fn pre_update(&self, predicate: &SubscribeRequest, update: &PreparedUpdate);
}

pub struct NaivePreUpdatePolicy;

#[async_trait]
impl PreUpdatePolicy for NaivePreUpdatePolicy {
    async fn pre_update(&self, _predicate: &SubscribeRequest, _update: &PreparedUpdate) {}
}

pub struct Spu {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<SpuJob>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct Shared {
    spuid: SpuId,
    predicate: SubscribeRequest,
    /// The predicate's endpoint-facing query form, derived once at creation
    query: QueryRequest,
    last_bindings: Mutex<BindingSet>,
    sequence: AtomicU64,
    state: Mutex<SpuState>,
}

impl Spu {
    /// Evaluates the predicate against the endpoint, seeds `last_bindings`
    /// and starts the worker task. On failure nothing has been registered
    /// yet and the half-built unit is simply dropped.
    pub(crate) async fn init(
        predicate: SubscribeRequest,
        endpoint: Arc<dyn SparqlEndpoint>,
        policy: Arc<dyn PreUpdatePolicy>,
        host: Arc<dyn SpuHost>,
    ) -> Result<Self, EndpointError> {
        let spuid = SpuId::new();
        let query = QueryRequest::from(&predicate);
        let shared = Arc::new(Shared {
            spuid,
            predicate,
            query,
            last_bindings: Mutex::new(BindingSet::new()),
            sequence: AtomicU64::new(0),
            state: Mutex::new(SpuState::Initializing),
        });

        let initial = endpoint.query(&shared.query).await?;
        debug!("SPU {} initialized with {} bindings", spuid, initial.len());
        *shared.last_bindings.lock().unwrap() = initial;
        shared.set_state(SpuState::Idle);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(shared.clone(), endpoint, policy, host, rx));
        Ok(Self { shared, jobs: tx, worker: Mutex::new(Some(handle)) })
    }

    pub fn spuid(&self) -> SpuId { self.shared.spuid }

    pub fn predicate(&self) -> &SubscribeRequest { &self.shared.predicate }

    pub fn state(&self) -> SpuState { *self.shared.state.lock().unwrap() }

    pub fn last_bindings(&self) -> BindingSet { self.shared.last_bindings.lock().unwrap().clone() }

    /// Hands a barrier job to the worker. Returns false once the unit is
    /// terminating and refuses further barrier participation.
    pub(crate) fn dispatch(&self, job: SpuJob) -> bool {
        if matches!(self.state(), SpuState::Terminating | SpuState::Dead) {
            return false;
        }
        self.jobs.send(job).is_ok()
    }

    /// First half of termination: stop accepting barriers and let the worker
    /// drain out.
    pub(crate) fn finish(&self) {
        self.shared.set_state(SpuState::Terminating);
        let _ = self.jobs.send(SpuJob::Finish);
    }

    /// Second half of termination: abort the worker in case it is wedged in
    /// endpoint I/O.
    pub(crate) fn interrupt(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub(crate) fn take_worker(&self) -> Option<tokio::task::JoinHandle<()>> { self.worker.lock().unwrap().take() }

    /// The full current result set, stamped with the next sequence number.
    /// Sent to each newly attached subscriber.
    pub(crate) fn snapshot_notification(&self) -> Notification {
        let bindings = self.last_bindings();
        self.shared.notification(NotificationEvent::InitialSnapshot { bindings })
    }

    pub(crate) fn terminated_notification(&self, reason: TerminationReason) -> Notification {
        self.shared.notification(NotificationEvent::Terminated { reason })
    }
}

impl Drop for Spu {
    fn drop(&mut self) { self.interrupt(); }
}

impl std::fmt::Debug for Spu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Spu {{ spuid: {}, state: {:?} }}", self.shared.spuid, self.state())
    }
}

impl Shared {
    fn set_state(&self, next: SpuState) {
        let mut state = self.state.lock().unwrap();
        trace!("SPU {} {:?} -> {:?}", self.spuid, *state, next);
        *state = next;
    }

    fn notification(&self, event: NotificationEvent) -> Notification {
        Notification { spuid: self.spuid, sequence: self.sequence.fetch_add(1, Ordering::Relaxed), event }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    endpoint: Arc<dyn SparqlEndpoint>,
    policy: Arc<dyn PreUpdatePolicy>,
    host: Arc<dyn SpuHost>,
    mut jobs: mpsc::UnboundedReceiver<SpuJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            SpuJob::PreUpdate(update) => {
                shared.set_state(SpuState::PreProcessing);
                policy.pre_update(&shared.predicate, &update).await;
                shared.set_state(SpuState::AwaitingEndpoint);
                host.end_of_processing(shared.spuid);
            }
            SpuJob::PostUpdate(outcome) => {
                post_update_processing(&shared, &outcome, endpoint.as_ref(), host.as_ref()).await;
            }
            SpuJob::Finish => break,
        }
    }
    shared.set_state(SpuState::Dead);
}

async fn post_update_processing(shared: &Shared, outcome: &Result<UpdateResponse, EndpointError>, endpoint: &dyn SparqlEndpoint, host: &dyn SpuHost) {
    shared.set_state(SpuState::PostProcessing);

    // a failed mutation changed nothing at the endpoint: bare acknowledgement
    let applied = matches!(outcome, Ok(response) if response.is_success());
    if !applied {
        shared.set_state(SpuState::Idle);
        host.end_of_processing(shared.spuid);
        return;
    }

    match endpoint.query(&shared.query).await {
        Ok(new_bindings) => {
            let (added, removed) = {
                let mut last = shared.last_bindings.lock().unwrap();
                let added = new_bindings.difference(&last);
                let removed = last.difference(&new_bindings);
                *last = new_bindings;
                (added, removed)
            };
            if !added.is_empty() {
                host.notify_event(shared.notification(NotificationEvent::Added { bindings: added }));
            }
            if !removed.is_empty() {
                host.notify_event(shared.notification(NotificationEvent::Removed { bindings: removed }));
            }
            shared.set_state(SpuState::Idle);
            host.end_of_processing(shared.spuid);
        }
        Err(e) => {
            // the unit stays alive with its previous result set; the next
            // barrier gets another chance
            warn!("SPU {} re-evaluation failed: {}", shared.spuid, e);
            shared.set_state(SpuState::Idle);
            host.exception_on_processing(shared.spuid);
        }
    }
}
