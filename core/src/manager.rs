//! The SPU manager: the single serialization point for update admission, the
//! only mutator of the registry, and the coordinator of the barrier protocol.
//!
//! The coarse monitor is split in the usual way for an async runtime: a
//! `tokio::sync::Mutex` admission guard serializes the gateway-facing
//! operation bodies (and is held across the barrier waits), while the shared
//! tables live behind a short-held `std::sync::Mutex` that worker
//! acknowledgements re-enter briefly. Workers never touch the admission
//! guard, so they can always signal completion while a barrier wait is
//! parked.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, Weak},
};

use sepa_proto::{
    BindingSet, Gid, Notification, QueryRequest, Sid, SubscribeRequest, SubscribeResponse, TerminationReason, UnsubscribeResponse,
    UpdateRequest, UpdateResponse,
};
use tokio::{
    sync::Notify,
    time::{timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::{BrokerConfig, FilterMode},
    endpoint::{prepare_update, PreparedUpdate, SparqlEndpoint},
    error::{BarrierPhase, EndpointError, QueryError, SubscribeError, UnsubscribeError, UpdateError},
    metrics::{BrokerMetrics, MetricsSnapshot},
    registry::{Registry, Subscriber},
    sink::{DependabilityMonitor, EventSink},
    spu::{NaivePreUpdatePolicy, PreUpdatePolicy, Spu, SpuHost, SpuJob, UpdateOutcome},
};

pub struct SpuManager {
    inner: Arc<Inner>,
}

impl Clone for SpuManager {
    fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

struct Inner {
    endpoint: Arc<dyn SparqlEndpoint>,
    config: BrokerConfig,
    metrics: BrokerMetrics,
    policy: Arc<dyn PreUpdatePolicy>,
    dependability: Arc<dyn DependabilityMonitor>,
    /// Admission monitor: serializes update/subscribe/unsubscribe bodies
    admission: tokio::sync::Mutex<()>,
    /// Shared tables; held briefly, never across an await
    state: Mutex<ManagerState>,
    pool_drained: Notify,
}

struct ManagerState {
    registry: Registry,
    processing_pool: HashSet<sepa_proto::SpuId>,
}

impl Default for ManagerState {
    fn default() -> Self { Self { registry: Registry::new(), processing_pool: HashSet::new() } }
}

/// The narrow capability handed to each SPU. Holds the manager weakly so the
/// registry's ownership of SPUs stays acyclic.
struct ManagerHost(Weak<Inner>);

impl SpuHost for ManagerHost {
    fn end_of_processing(&self, spuid: sepa_proto::SpuId) {
        if let Some(inner) = self.0.upgrade() {
            inner.complete(spuid, false);
        }
    }

    fn exception_on_processing(&self, spuid: sepa_proto::SpuId) {
        if let Some(inner) = self.0.upgrade() {
            inner.complete(spuid, true);
        }
    }

    fn notify_event(&self, notification: Notification) {
        if let Some(inner) = self.0.upgrade() {
            inner.notify_event(notification);
        }
    }
}

impl SpuManager {
    pub fn new(endpoint: Arc<dyn SparqlEndpoint>, config: BrokerConfig) -> Self {
        Self::with_collaborators(endpoint, config, Arc::new(NaivePreUpdatePolicy), Arc::new(()))
    }

    pub fn with_collaborators(
        endpoint: Arc<dyn SparqlEndpoint>,
        config: BrokerConfig,
        policy: Arc<dyn PreUpdatePolicy>,
        dependability: Arc<dyn DependabilityMonitor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                config,
                metrics: BrokerMetrics::default(),
                policy,
                dependability,
                admission: tokio::sync::Mutex::new(()),
                state: Mutex::new(ManagerState::default()),
                pool_drained: Notify::new(),
            }),
        }
    }

    /// Admits one update: pre-update barrier across the filtered SPUs, the
    /// endpoint mutation, then the post-update barrier during which SPUs emit
    /// their deltas. Updates are linearized by the admission monitor.
    pub async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse, UpdateError> {
        let _admission = self.inner.admission.lock().await;
        self.inner.metrics.record_update();

        let prepared = Arc::new(prepare_update(&request)?);
        let active = self.inner.filter(&prepared);
        debug!("update admitted against {} active SPUs", active.len());

        if active.is_empty() {
            return Ok(self.inner.apply_update(&prepared).await?);
        }

        let per_spu = self.inner.config.spu_processing_timeout();

        // Pre-update barrier; budget scales with the pool
        let started = std::time::Instant::now();
        self.inner.arm_pool(&active);
        for spu in &active {
            if !spu.dispatch(SpuJob::PreUpdate(prepared.clone())) {
                self.inner.complete(spu.spuid(), false);
            }
        }
        let deadline = Instant::now() + per_spu * active.len() as u32;
        if !self.inner.wait_pool_drained(deadline).await {
            self.inner.abandon_pool(BarrierPhase::Pre);
            self.inner.metrics.record_pre_timeout();
            return Err(UpdateError::Timeout { phase: BarrierPhase::Pre });
        }
        self.inner.metrics.record_pre_barrier(started.elapsed().as_nanos() as u64);

        let outcome: UpdateOutcome = Arc::new(self.inner.apply_update(&prepared).await);

        // Post-update barrier: a diff and emit, not a speculative pre-check,
        // so the budget is the scalar per-SPU timeout
        let started = std::time::Instant::now();
        self.inner.arm_pool(&active);
        for spu in &active {
            if !spu.dispatch(SpuJob::PostUpdate(outcome.clone())) {
                self.inner.complete(spu.spuid(), false);
            }
        }
        let deadline = Instant::now() + per_spu;
        if !self.inner.wait_pool_drained(deadline).await {
            self.inner.abandon_pool(BarrierPhase::Post);
            self.inner.metrics.record_post_timeout();
            return Err(UpdateError::Timeout { phase: BarrierPhase::Post });
        }
        self.inner.metrics.record_post_barrier(started.elapsed().as_nanos() as u64);

        Ok((*outcome).clone()?)
    }

    /// Attaches a subscriber, de-duplicating onto an existing SPU when the
    /// request fingerprint is already live. The new subscriber alone receives
    /// the `InitialSnapshot` notification.
    pub async fn subscribe(&self, request: SubscribeRequest, sink: Arc<dyn EventSink>) -> Result<SubscribeResponse, SubscribeError> {
        let _admission = self.inner.admission.lock().await;
        if request.sparql.trim().is_empty() {
            return Err(SubscribeError::BadRequest("empty query".to_string()));
        }
        self.inner.metrics.record_subscribe();

        let existing = {
            let state = self.inner.state.lock().unwrap();
            if state.registry.contains(&request) {
                state.registry.get_spu(&request)
            } else {
                None
            }
        };
        let spu = match existing {
            Some(spu) => {
                debug!("subscribe deduplicated onto SPU {}", spu.spuid());
                spu
            }
            None => {
                let host: Arc<dyn SpuHost> = Arc::new(ManagerHost(Arc::downgrade(&self.inner)));
                let spu = Arc::new(Spu::init(request.clone(), self.inner.endpoint.clone(), self.inner.policy.clone(), host).await?);
                let mut state = self.inner.state.lock().unwrap();
                match state.registry.register(spu.clone()) {
                    Ok(()) => spu,
                    // unreachable while the admission monitor serializes
                    // subscribes; fold into the unit that won the slot
                    Err(_) => state.registry.get_spu(&request).unwrap_or(spu),
                }
            }
        };

        let subscriber = {
            let mut state = self.inner.state.lock().unwrap();
            let subscriber = state.registry.add_subscriber(&request, spu.spuid(), sink);
            self.inner.refresh_gauges(&state);
            subscriber
        };

        let initial = spu.last_bindings();
        if let Err(e) = subscriber.notify(spu.snapshot_notification()) {
            warn!("initial snapshot delivery to {} failed: {}", subscriber.sid, e);
            self.inner.dependability.connection_lost(&subscriber.gid);
        }

        Ok(SubscribeResponse { sid: subscriber.sid, spuid: spu.spuid(), alias: request.alias, initial })
    }

    /// Detaches a subscriber; terminating its SPU if it was the last one.
    pub async fn unsubscribe(&self, sid: &Sid, gid: &Gid) -> Result<UnsubscribeResponse, UnsubscribeError> {
        let _admission = self.inner.admission.lock().await;
        self.inner.metrics.record_unsubscribe();
        {
            let state = self.inner.state.lock().unwrap();
            let subscriber = state.registry.get_subscriber(sid).map_err(|_| UnsubscribeError::NotFound(*sid))?;
            if &subscriber.gid != gid {
                warn!("unsubscribe for {} arrived via {} but was registered to {}", sid, gid, subscriber.gid);
            }
        }
        self.inner.detach_subscriber(sid, TerminationReason::Unsubscribed)?;
        self.inner.dependability.unsubscribed(sid, gid);
        Ok(UnsubscribeResponse { sid: *sid })
    }

    /// Variant used when the gateway already knows the connection is dead;
    /// side-effectful only, and skips the dependability notification.
    pub async fn kill_subscription(&self, sid: &Sid, gid: &Gid) {
        let _admission = self.inner.admission.lock().await;
        self.inner.metrics.record_unsubscribe();
        match self.inner.detach_subscriber(sid, TerminationReason::ConnectionLost) {
            Ok(subscriber) => {
                if &subscriber.gid != gid {
                    warn!("kill for {} arrived via {} but was registered to {}", sid, gid, subscriber.gid);
                }
            }
            Err(UnsubscribeError::NotFound(_)) => debug!("kill for unknown subscriber {}", sid),
        }
    }

    /// Tears down every subscription of a closed gateway connection.
    pub async fn connection_closed(&self, gid: &Gid) {
        let _admission = self.inner.admission.lock().await;
        let sids = { self.inner.state.lock().unwrap().registry.sids_of_gid(gid) };
        debug!("connection {} closed with {} subscriptions", gid, sids.len());
        for sid in sids {
            self.inner.metrics.record_unsubscribe();
            let _ = self.inner.detach_subscriber(&sid, TerminationReason::ConnectionLost);
        }
    }

    /// Read passthrough to the endpoint. Queries mutate nothing, so they are
    /// not admitted through the monitor.
    pub async fn query(&self, request: QueryRequest) -> Result<BindingSet, QueryError> {
        if request.sparql.trim().is_empty() {
            return Err(QueryError::BadRequest("empty query".to_string()));
        }
        self.inner.metrics.record_query();
        Ok(self.inner.endpoint.query(&request).await?)
    }

    /// Orderly teardown: every subscriber sees `Terminated(Shutdown)` and
    /// every worker is drained.
    pub async fn shutdown(&self) {
        let _admission = self.inner.admission.lock().await;
        let spus = { self.inner.state.lock().unwrap().registry.spus() };
        let mut workers = Vec::new();
        for spu in spus {
            let notification = spu.terminated_notification(TerminationReason::Shutdown);
            {
                let mut state = self.inner.state.lock().unwrap();
                state.registry.notify_subscribers(&spu.spuid(), &notification);
                let _ = state.registry.remove_spu(&spu.spuid());
                self.inner.refresh_gauges(&state);
            }
            spu.finish();
            if let Some(handle) = spu.take_worker() {
                workers.push(handle);
            }
        }
        let _ = futures::future::join_all(workers).await;
        info!("broker shut down");
    }

    pub fn config(&self) -> &BrokerConfig { &self.inner.config }

    pub fn metrics(&self) -> MetricsSnapshot { self.inner.metrics.snapshot(self.inner.config.unit_scale()) }

    pub fn active_spus(&self) -> usize { self.inner.state.lock().unwrap().registry.spu_count() }

    pub fn active_subscribers(&self) -> usize { self.inner.state.lock().unwrap().registry.subscriber_count() }
}

impl Inner {
    /// Selects the SPUs an update could possibly affect. The contract: no
    /// SPU whose result set would actually change may be omitted. `All` is
    /// the always-correct default.
    fn filter(&self, prepared: &PreparedUpdate) -> Vec<Arc<Spu>> {
        let state = self.state.lock().unwrap();
        let spus = state.registry.spus();
        match self.config.filter_mode() {
            FilterMode::All => spus,
            FilterMode::Lut => spus.into_iter().filter(|spu| graphs_may_intersect(spu.predicate(), prepared)).collect(),
        }
    }

    fn arm_pool(&self, active: &[Arc<Spu>]) {
        let mut state = self.state.lock().unwrap();
        state.processing_pool.clear();
        state.processing_pool.extend(active.iter().map(|spu| spu.spuid()));
    }

    fn abandon_pool(&self, phase: BarrierPhase) {
        let mut state = self.state.lock().unwrap();
        let stragglers = state.processing_pool.len();
        state.processing_pool.clear();
        warn!("{} barrier abandoned with {} unacknowledged SPUs", phase, stragglers);
    }

    /// Barrier acknowledgement ingress. Acks for SPUs not in the current
    /// pool are stragglers from an abandoned barrier and are ignored.
    fn complete(&self, spuid: sepa_proto::SpuId, errored: bool) {
        let mut state = self.state.lock().unwrap();
        if state.processing_pool.remove(&spuid) {
            if state.processing_pool.is_empty() {
                self.pool_drained.notify_one();
            }
        } else {
            warn!("late acknowledgement from {} ignored", spuid);
        }
        if errored {
            self.metrics.record_spu_exception();
        }
    }

    /// Waits for the pool to drain, distinguishing completion from deadline
    /// expiry by re-checking emptiness on every wakeup.
    async fn wait_pool_drained(&self, deadline: Instant) -> bool {
        loop {
            let drained = { self.state.lock().unwrap().processing_pool.is_empty() };
            if drained {
                return true;
            }
            if timeout_at(deadline, self.pool_drained.notified()).await.is_err() {
                // completion may have raced the timer
                let drained = { self.state.lock().unwrap().processing_pool.is_empty() };
                return drained;
            }
        }
    }

    /// Applies the mutation with the configured retry budget. Authorization
    /// rejections are final and never retried.
    async fn apply_update(&self, prepared: &PreparedUpdate) -> Result<UpdateResponse, EndpointError> {
        let budget = self.config.endpoint_retry_budget();
        let mut attempt = 0;
        loop {
            match self.endpoint.update(prepared).await {
                Ok(response) => return Ok(response),
                Err(EndpointError::Auth) => return Err(EndpointError::Auth),
                Err(e) if attempt < budget => {
                    attempt += 1;
                    self.metrics.record_endpoint_retry();
                    warn!("endpoint mutation failed, retrying ({}/{}): {}", attempt, budget, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fan-out ingress from the SPUs. The membership check drops stragglers
    /// from already-terminated units.
    fn notify_event(&self, notification: Notification) {
        let lost = {
            let state = self.state.lock().unwrap();
            if !state.registry.has_spu(&notification.spuid) {
                debug!("dropping notification from terminated SPU {}", notification.spuid);
                return;
            }
            state.registry.notify_subscribers(&notification.spuid, &notification)
        };
        self.metrics.record_notification();
        for gid in lost {
            self.dependability.connection_lost(&gid);
        }
    }

    fn detach_subscriber(&self, sid: &Sid, reason: TerminationReason) -> Result<Subscriber, UnsubscribeError> {
        let (subscriber, terminated) = {
            let mut state = self.state.lock().unwrap();
            let (subscriber, now_empty) = state.registry.remove_subscriber(sid).map_err(|_| UnsubscribeError::NotFound(*sid))?;
            let spu = if now_empty { state.registry.remove_spu(&subscriber.spuid) } else { None };
            self.refresh_gauges(&state);
            (subscriber, spu)
        };

        if let Some(spu) = terminated {
            // the departing subscriber is the last sink left; best effort
            if let Err(e) = subscriber.notify(spu.terminated_notification(reason)) {
                debug!("termination notice to {} undeliverable: {}", subscriber.sid, e);
            }
            spu.finish();
            spu.interrupt();
            debug!("SPU {} terminated ({})", spu.spuid(), reason);
        }
        Ok(subscriber)
    }

    fn refresh_gauges(&self, state: &ManagerState) {
        self.metrics.set_active_spus(state.registry.spu_count() as u64);
        self.metrics.set_active_subscribers(state.registry.subscriber_count() as u64);
    }
}

/// Conservative graph-footprint test for `FilterMode::Lut`: an SPU is only
/// skipped when both it and the update name graphs and the sets are
/// disjoint. An omitted SPU must provably see identical results before and
/// after the update.
fn graphs_may_intersect(predicate: &SubscribeRequest, update: &PreparedUpdate) -> bool {
    if update.using_graphs.is_empty() && update.using_named_graphs.is_empty() {
        return true;
    }
    if predicate.default_graphs.is_empty() && predicate.named_graphs.is_empty() {
        return true;
    }
    let targets: HashSet<&String> = update.using_graphs.iter().chain(&update.using_named_graphs).collect();
    predicate.default_graphs.iter().chain(&predicate.named_graphs).any(|uri| targets.contains(uri))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicate(graphs: &[&str]) -> SubscribeRequest {
        let mut request = SubscribeRequest::new("SELECT * WHERE { ?s ?p ?o }", "c");
        for uri in graphs {
            request = request.with_default_graph(*uri);
        }
        request
    }

    fn update(graphs: &[&str]) -> PreparedUpdate {
        let mut request = UpdateRequest::new("INSERT DATA { a p 1 }");
        for uri in graphs {
            request = request.with_using_graph(*uri);
        }
        prepare_update(&request).unwrap()
    }

    #[test]
    fn lut_filter_is_conservative() {
        // either side naming no graphs always intersects
        assert!(graphs_may_intersect(&predicate(&[]), &update(&[])));
        assert!(graphs_may_intersect(&predicate(&[]), &update(&["g1"])));
        assert!(graphs_may_intersect(&predicate(&["g1"]), &update(&[])));

        assert!(graphs_may_intersect(&predicate(&["g1", "g2"]), &update(&["g2"])));
        assert!(!graphs_may_intersect(&predicate(&["g1"]), &update(&["g2"])));
    }
}
