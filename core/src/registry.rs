//! Canonical home of SPUs and subscribers.
//!
//! Plain tables with no locking of their own: every access happens under the
//! manager's monitor, which keeps the cross-table invariants trivially
//! atomic. A subscriber appears in exactly one `spu_subscribers` set, its sid
//! is in `by_sid`, and the owning SPU resolves both by spuid and by the
//! fingerprint of its predicate.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use sepa_proto::{Fingerprint, Gid, Notification, Sid, SpuId, SubscribeRequest};
use tracing::{debug, warn};

use crate::{
    error::RegistryError,
    sink::EventSink,
    spu::Spu,
};

/// A single attachment of a gateway connection to an SPU.
#[derive(Clone)]
pub struct Subscriber {
    pub sid: Sid,
    pub gid: Gid,
    pub spuid: SpuId,
    sink: Arc<dyn EventSink>,
}

impl Subscriber {
    pub(crate) fn notify(&self, notification: Notification) -> Result<(), crate::sink::SinkError> { self.sink.notify(notification) }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subscriber {{ sid: {}, gid: {}, spuid: {} }}", self.sid, self.gid, self.spuid)
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    by_fingerprint: HashMap<Fingerprint, SpuId>,
    by_spuid: HashMap<SpuId, Arc<Spu>>,
    by_sid: HashMap<Sid, Subscriber>,
    by_gid: HashMap<Gid, HashSet<Sid>>,
    spu_subscribers: HashMap<SpuId, HashSet<Sid>>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    pub fn contains(&self, request: &SubscribeRequest) -> bool { self.by_fingerprint.contains_key(&request.fingerprint()) }

    pub fn get_spu(&self, request: &SubscribeRequest) -> Option<Arc<Spu>> {
        let spuid = self.by_fingerprint.get(&request.fingerprint())?;
        self.by_spuid.get(spuid).cloned()
    }

    pub fn has_spu(&self, spuid: &SpuId) -> bool { self.by_spuid.contains_key(spuid) }

    pub fn spus(&self) -> Vec<Arc<Spu>> { self.by_spuid.values().cloned().collect() }

    pub fn spu_count(&self) -> usize { self.by_spuid.len() }

    pub fn subscriber_count(&self) -> usize { self.by_sid.len() }

    /// Inserts a freshly initialized SPU. The fingerprint slot must be free.
    pub fn register(&mut self, spu: Arc<Spu>) -> Result<(), RegistryError> {
        use std::collections::hash_map::Entry;
        match self.by_fingerprint.entry(spu.predicate().fingerprint()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists),
            Entry::Vacant(slot) => {
                let spuid = spu.spuid();
                slot.insert(spuid);
                self.spu_subscribers.insert(spuid, HashSet::new());
                self.by_spuid.insert(spuid, spu);
                Ok(())
            }
        }
    }

    /// Mints a sid and attaches the connection to the SPU.
    pub fn add_subscriber(&mut self, request: &SubscribeRequest, spuid: SpuId, sink: Arc<dyn EventSink>) -> Subscriber {
        let subscriber = Subscriber { sid: Sid::new(), gid: request.gid.clone(), spuid, sink };
        self.spu_subscribers.entry(spuid).or_default().insert(subscriber.sid);
        self.by_gid.entry(subscriber.gid.clone()).or_default().insert(subscriber.sid);
        self.by_sid.insert(subscriber.sid, subscriber.clone());
        debug!("subscriber {} attached to SPU {}", subscriber.sid, spuid);
        subscriber
    }

    pub fn get_subscriber(&self, sid: &Sid) -> Result<&Subscriber, RegistryError> {
        self.by_sid.get(sid).ok_or(RegistryError::NotFound(*sid))
    }

    /// Detaches a subscriber from every table. The boolean is true iff the
    /// owning SPU just lost its last subscriber, in which case the caller
    /// must terminate it.
    pub fn remove_subscriber(&mut self, sid: &Sid) -> Result<(Subscriber, bool), RegistryError> {
        let subscriber = self.by_sid.remove(sid).ok_or(RegistryError::NotFound(*sid))?;

        if let Some(sids) = self.by_gid.get_mut(&subscriber.gid) {
            sids.remove(sid);
            if sids.is_empty() {
                self.by_gid.remove(&subscriber.gid);
            }
        }

        let now_empty = match self.spu_subscribers.get_mut(&subscriber.spuid) {
            Some(sids) => {
                sids.remove(sid);
                sids.is_empty()
            }
            None => false,
        };
        Ok((subscriber, now_empty))
    }

    pub fn subscribers_of(&self, spuid: &SpuId) -> impl Iterator<Item = &Subscriber> {
        self.spu_subscribers.get(spuid).into_iter().flatten().filter_map(|sid| self.by_sid.get(sid))
    }

    pub fn sids_of_gid(&self, gid: &Gid) -> Vec<Sid> { self.by_gid.get(gid).map(|sids| sids.iter().copied().collect()).unwrap_or_default() }

    /// Unlinks an SPU and any subscribers still attached to it, in one step.
    pub fn remove_spu(&mut self, spuid: &SpuId) -> Option<Arc<Spu>> {
        let spu = self.by_spuid.remove(spuid)?;
        self.by_fingerprint.remove(&spu.predicate().fingerprint());
        for sid in self.spu_subscribers.remove(spuid).unwrap_or_default() {
            if let Some(subscriber) = self.by_sid.remove(&sid) {
                if let Some(sids) = self.by_gid.get_mut(&subscriber.gid) {
                    sids.remove(&sid);
                    if sids.is_empty() {
                        self.by_gid.remove(&subscriber.gid);
                    }
                }
            }
        }
        Some(spu)
    }

    /// Best-effort fan-out to everyone attached to the SPU. Returns the
    /// connection ids whose sinks turned out to be dead; delivery to the
    /// remaining subscribers is unaffected.
    pub fn notify_subscribers(&self, spuid: &SpuId, notification: &Notification) -> Vec<Gid> {
        let mut lost = Vec::new();
        for subscriber in self.subscribers_of(spuid) {
            if let Err(e) = subscriber.notify(notification.clone()) {
                warn!("delivery to {} failed: {}", subscriber.sid, e);
                lost.push(subscriber.gid.clone());
            }
        }
        lost
    }

    /// Cross-table invariants, checked from tests.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        for (fingerprint, spuid) in &self.by_fingerprint {
            let spu = self.by_spuid.get(spuid).expect("fingerprint points at a live SPU");
            assert_eq!(&spu.predicate().fingerprint(), fingerprint);
            assert!(self.spu_subscribers.contains_key(spuid));
        }
        assert_eq!(self.by_fingerprint.len(), self.by_spuid.len());

        let mut seen = std::collections::HashSet::new();
        for (spuid, sids) in &self.spu_subscribers {
            for sid in sids {
                assert!(seen.insert(*sid), "sid appears in exactly one spu_subscribers set");
                let subscriber = self.by_sid.get(sid).expect("attached sid is in by_sid");
                assert_eq!(&subscriber.spuid, spuid);
                assert!(self.by_gid.get(&subscriber.gid).is_some_and(|sids| sids.contains(sid)));
            }
        }
        assert_eq!(seen.len(), self.by_sid.len());
    }
}
