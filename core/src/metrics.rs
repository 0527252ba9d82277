//! Instance-scoped broker metrics.
//!
//! Atomic counters updated on the hot paths, read through [`snapshot`]
//! (typically exposed by an admin surface). Barrier timings accumulate in
//! nanoseconds and are rendered in the configured unit scale.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::UnitScale;

#[derive(Default)]
pub struct BrokerMetrics {
    updates_total: AtomicU64,
    subscribes_total: AtomicU64,
    unsubscribes_total: AtomicU64,
    queries_total: AtomicU64,
    notifications_total: AtomicU64,
    pre_timeouts: AtomicU64,
    post_timeouts: AtomicU64,
    spu_exceptions: AtomicU64,
    endpoint_retries: AtomicU64,

    // gauges; the registry mutators are the only writers
    active_spus: AtomicU64,
    active_subscribers: AtomicU64,

    pre_barriers: AtomicU64,
    pre_barrier_nanos: AtomicU64,
    post_barriers: AtomicU64,
    post_barrier_nanos: AtomicU64,
}

impl BrokerMetrics {
    pub fn record_update(&self) { self.updates_total.fetch_add(1, Ordering::Relaxed); }

    pub fn record_subscribe(&self) { self.subscribes_total.fetch_add(1, Ordering::Relaxed); }

    pub fn record_unsubscribe(&self) { self.unsubscribes_total.fetch_add(1, Ordering::Relaxed); }

    pub fn record_query(&self) { self.queries_total.fetch_add(1, Ordering::Relaxed); }

    pub fn record_notification(&self) { self.notifications_total.fetch_add(1, Ordering::Relaxed); }

    pub fn record_pre_timeout(&self) { self.pre_timeouts.fetch_add(1, Ordering::Relaxed); }

    pub fn record_post_timeout(&self) { self.post_timeouts.fetch_add(1, Ordering::Relaxed); }

    pub fn record_spu_exception(&self) { self.spu_exceptions.fetch_add(1, Ordering::Relaxed); }

    pub fn record_endpoint_retry(&self) { self.endpoint_retries.fetch_add(1, Ordering::Relaxed); }

    pub fn record_pre_barrier(&self, nanos: u64) {
        self.pre_barriers.fetch_add(1, Ordering::Relaxed);
        self.pre_barrier_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn record_post_barrier(&self, nanos: u64) {
        self.post_barriers.fetch_add(1, Ordering::Relaxed);
        self.post_barrier_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn set_active_spus(&self, count: u64) { self.active_spus.store(count, Ordering::Relaxed); }

    pub fn set_active_subscribers(&self, count: u64) { self.active_subscribers.store(count, Ordering::Relaxed); }

    pub fn snapshot(&self, scale: UnitScale) -> MetricsSnapshot {
        let pre_barriers = self.pre_barriers.load(Ordering::Relaxed);
        let post_barriers = self.post_barriers.load(Ordering::Relaxed);
        MetricsSnapshot {
            updates_total: self.updates_total.load(Ordering::Relaxed),
            subscribes_total: self.subscribes_total.load(Ordering::Relaxed),
            unsubscribes_total: self.unsubscribes_total.load(Ordering::Relaxed),
            queries_total: self.queries_total.load(Ordering::Relaxed),
            notifications_total: self.notifications_total.load(Ordering::Relaxed),
            pre_timeouts: self.pre_timeouts.load(Ordering::Relaxed),
            post_timeouts: self.post_timeouts.load(Ordering::Relaxed),
            spu_exceptions: self.spu_exceptions.load(Ordering::Relaxed),
            endpoint_retries: self.endpoint_retries.load(Ordering::Relaxed),
            active_spus: self.active_spus.load(Ordering::Relaxed),
            active_subscribers: self.active_subscribers.load(Ordering::Relaxed),
            avg_pre_barrier: average(scale, self.pre_barrier_nanos.load(Ordering::Relaxed), pre_barriers),
            avg_post_barrier: average(scale, self.post_barrier_nanos.load(Ordering::Relaxed), post_barriers),
            unit_scale: scale,
        }
    }
}

fn average(scale: UnitScale, total_nanos: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        scale.from_nanos(total_nanos) / count as f64
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub updates_total: u64,
    pub subscribes_total: u64,
    pub unsubscribes_total: u64,
    pub queries_total: u64,
    pub notifications_total: u64,
    pub pre_timeouts: u64,
    pub post_timeouts: u64,
    pub spu_exceptions: u64,
    pub endpoint_retries: u64,
    pub active_spus: u64,
    pub active_subscribers: u64,
    /// Mean barrier duration in `unit_scale` units
    pub avg_pre_barrier: f64,
    pub avg_post_barrier: f64,
    pub unit_scale: UnitScale,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_respect_unit_scale() {
        let metrics = BrokerMetrics::default();
        metrics.record_pre_barrier(2_000_000);
        metrics.record_pre_barrier(4_000_000);

        assert_eq!(metrics.snapshot(UnitScale::Ms).avg_pre_barrier, 3.0);
        assert_eq!(metrics.snapshot(UnitScale::Us).avg_pre_barrier, 3000.0);
        assert_eq!(metrics.snapshot(UnitScale::Ns).avg_post_barrier, 0.0);
    }

    #[test]
    fn gauges_store_rather_than_accumulate() {
        let metrics = BrokerMetrics::default();
        metrics.set_active_spus(4);
        metrics.set_active_spus(2);
        assert_eq!(metrics.snapshot(UnitScale::Ms).active_spus, 2);
    }
}
