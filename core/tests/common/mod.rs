#![allow(dead_code)]

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use sepa_core::{
    endpoint::{PreparedUpdate, SparqlEndpoint},
    error::EndpointError,
    sink::DependabilityMonitor,
    spu::PreUpdatePolicy,
};
use sepa_core::proto::{Binding, BindingSet, Gid, Notification, QueryRequest, RdfTerm, Sid, SubscribeRequest, UpdateResponse};
use tokio::sync::mpsc;

pub type Triple = (String, String, String);

/// In-memory stand-in for the physical RDF endpoint. Understands just enough
/// SPARQL for the tests: `INSERT DATA` / `DELETE DATA` blocks (`;`-chained)
/// and single-pattern `SELECT` queries.
#[derive(Default)]
pub struct MemoryEndpoint {
    triples: Mutex<BTreeSet<Triple>>,
    fail_updates: AtomicU32,
    fail_queries: AtomicU32,
    denied_principal: Mutex<Option<String>>,
}

impl MemoryEndpoint {
    pub fn new() -> Self { Self::default() }

    pub fn with_triples(triples: &[(&str, &str, &str)]) -> Self {
        let endpoint = Self::new();
        {
            let mut store = endpoint.triples.lock().unwrap();
            for (s, p, o) in triples {
                store.insert((s.to_string(), p.to_string(), o.to_string()));
            }
        }
        endpoint
    }

    /// The next `n` mutations answer with a store failure.
    pub fn fail_next_updates(&self, n: u32) { self.fail_updates.store(n, Ordering::Relaxed); }

    /// The next `n` queries answer with a store failure.
    pub fn fail_next_queries(&self, n: u32) { self.fail_queries.store(n, Ordering::Relaxed); }

    /// Requests carrying this principal are rejected as unauthorized.
    pub fn deny_principal(&self, principal: &str) { *self.denied_principal.lock().unwrap() = Some(principal.to_string()); }

    pub fn triple_count(&self) -> usize { self.triples.lock().unwrap().len() }

    fn denies(&self, principal: &Option<String>) -> bool {
        match (&*self.denied_principal.lock().unwrap(), principal) {
            (Some(denied), Some(given)) => denied == given,
            _ => false,
        }
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1)).is_ok()
}

#[async_trait]
impl SparqlEndpoint for MemoryEndpoint {
    async fn query(&self, request: &QueryRequest) -> Result<BindingSet, EndpointError> {
        if self.denies(&request.principal) {
            return Err(EndpointError::Auth);
        }
        if take_failure(&self.fail_queries) {
            return Err(EndpointError::Store("injected query failure".to_string()));
        }

        let (projection, pattern) = parse_select(&request.sparql).ok_or_else(|| EndpointError::Store("unsupported query".to_string()))?;
        let triples = self.triples.lock().unwrap();
        let mut results = BindingSet::new();
        for triple in triples.iter() {
            if let Some(bound) = match_triple(&pattern, triple) {
                let mut binding = Binding::new();
                for (name, value) in bound {
                    if projection.is_empty() || projection.contains(&name) {
                        binding.insert(name, term(&value));
                    }
                }
                results.insert(binding);
            }
        }
        Ok(results)
    }

    async fn update(&self, update: &PreparedUpdate) -> Result<UpdateResponse, EndpointError> {
        if self.denies(&update.principal) {
            return Err(EndpointError::Auth);
        }
        if take_failure(&self.fail_updates) {
            return Err(EndpointError::Store("injected update failure".to_string()));
        }

        let mut triples = self.triples.lock().unwrap();
        for operation in update.sparql.split(';') {
            let operation = operation.trim();
            if operation.is_empty() {
                continue;
            }
            if let Some(block) = operation.strip_prefix("INSERT DATA") {
                for triple in parse_triples(brace_body(block)?) {
                    triples.insert(triple);
                }
            } else if let Some(block) = operation.strip_prefix("DELETE DATA") {
                for triple in parse_triples(brace_body(block)?) {
                    triples.remove(&triple);
                }
            } else {
                return Err(EndpointError::Store(format!("unsupported update: {operation}")));
            }
        }
        Ok(UpdateResponse::ok())
    }
}

enum PatternTerm {
    Var(String),
    Const(String),
}

fn parse_select(sparql: &str) -> Option<(Vec<String>, [PatternTerm; 3])> {
    let rest = sparql.trim().strip_prefix("SELECT")?;
    let (head, where_part) = rest.split_once("WHERE")?;
    let projection: Vec<String> = head.split_whitespace().filter_map(|t| t.strip_prefix('?')).map(str::to_string).collect();

    let tokens: Vec<&str> = brace_body(where_part).ok()?.split_whitespace().filter(|t| *t != ".").collect();
    if tokens.len() != 3 {
        return None;
    }
    let pattern = |token: &str| match token.strip_prefix('?') {
        Some(name) => PatternTerm::Var(name.to_string()),
        None => PatternTerm::Const(token.to_string()),
    };
    Some((projection, [pattern(tokens[0]), pattern(tokens[1]), pattern(tokens[2])]))
}

fn brace_body(block: &str) -> Result<&str, EndpointError> {
    let open = block.find('{').ok_or_else(|| EndpointError::Store("missing '{'".to_string()))?;
    let close = block.rfind('}').ok_or_else(|| EndpointError::Store("missing '}'".to_string()))?;
    Ok(&block[open + 1..close])
}

fn parse_triples(body: &str) -> Vec<Triple> {
    body.split('.')
        .filter_map(|group| {
            let tokens: Vec<&str> = group.split_whitespace().collect();
            match tokens.as_slice() {
                [s, p, o] => Some((s.to_string(), p.to_string(), o.to_string())),
                _ => None,
            }
        })
        .collect()
}

fn match_triple(pattern: &[PatternTerm; 3], triple: &Triple) -> Option<Vec<(String, String)>> {
    let mut bound: Vec<(String, String)> = Vec::new();
    for (part, value) in pattern.iter().zip([&triple.0, &triple.1, &triple.2]) {
        match part {
            PatternTerm::Const(expected) => {
                if expected != value {
                    return None;
                }
            }
            PatternTerm::Var(name) => {
                if let Some((_, prior)) = bound.iter().find(|(n, _)| n == name) {
                    if prior != value {
                        return None;
                    }
                } else {
                    bound.push((name.clone(), value.clone()));
                }
            }
        }
    }
    Some(bound)
}

/// Tokens in test data follow the convention of the scenarios: bare numbers
/// are literals, everything else is an IRI.
pub fn term(token: &str) -> RdfTerm {
    if !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()) {
        RdfTerm::literal(token)
    } else {
        RdfTerm::iri(token)
    }
}

pub fn solution(pairs: &[(&str, &str)]) -> Binding {
    let mut binding = Binding::new();
    for (variable, value) in pairs {
        binding.insert(*variable, term(value));
    }
    binding
}

pub fn solutions(all: &[&[(&str, &str)]]) -> BindingSet { all.iter().map(|pairs| solution(pairs)).collect() }

/// Records dependability callbacks for assertions.
#[derive(Default)]
pub struct RecordingMonitor {
    pub unsubscribed: Mutex<Vec<(Sid, Gid)>>,
    pub lost: Mutex<Vec<Gid>>,
}

impl DependabilityMonitor for RecordingMonitor {
    fn unsubscribed(&self, sid: &Sid, gid: &Gid) { self.unsubscribed.lock().unwrap().push((*sid, gid.clone())); }

    fn connection_lost(&self, gid: &Gid) { self.lost.lock().unwrap().push(gid.clone()); }
}

/// Pre-update policy that stalls the first barrier for SPUs carrying the
/// given alias, simulating a wedged worker.
pub struct SleepyPolicy {
    alias: String,
    delay: Duration,
    once: AtomicBool,
}

impl SleepyPolicy {
    pub fn new(alias: &str, delay: Duration) -> Self { Self { alias: alias.to_string(), delay, once: AtomicBool::new(false) } }
}

#[async_trait]
impl PreUpdatePolicy for SleepyPolicy {
    async fn pre_update(&self, predicate: &SubscribeRequest, _update: &PreparedUpdate) {
        if predicate.alias.as_deref() == Some(self.alias.as_str()) && !self.once.swap(true, Ordering::Relaxed) {
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// Collects everything currently sitting in a subscriber's channel.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut notifications = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        notifications.push(notification);
    }
    notifications
}

pub fn init_tracing() { let _ = tracing_subscriber::fmt().with_test_writer().try_init(); }
