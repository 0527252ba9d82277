mod common;

use std::{sync::Arc, time::Duration};

use common::{drain, solutions, MemoryEndpoint, SleepyPolicy};
use sepa_core::{
    error::{BarrierPhase, UnsubscribeError, UpdateError},
    proto::{Gid, NotificationEvent, QueryRequest, SubscribeRequest, TerminationReason, UpdateRequest},
    sink::ChannelSink,
    BrokerConfig, SpuManager,
};

#[tokio::test]
async fn subscribe_delivers_initial_snapshot() -> anyhow::Result<()> {
    let endpoint = Arc::new(MemoryEndpoint::with_triples(&[("a", "p", "1")]));
    let manager = SpuManager::new(endpoint, BrokerConfig::new());

    let (sink, mut rx) = ChannelSink::pair();
    let response = manager.subscribe(SubscribeRequest::new("SELECT ?x WHERE { ?x p ?v }", "c1"), Arc::new(sink)).await?;

    assert_eq!(response.initial, solutions(&[&[("x", "a")]]));

    let received = drain(&mut rx);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].sequence, 0);
    assert_eq!(received[0].event, NotificationEvent::InitialSnapshot { bindings: solutions(&[&[("x", "a")]]) });
    Ok(())
}

#[tokio::test]
async fn updates_produce_added_then_removed_deltas() -> anyhow::Result<()> {
    let endpoint = Arc::new(MemoryEndpoint::with_triples(&[("a", "p", "1")]));
    let manager = SpuManager::new(endpoint, BrokerConfig::new());

    let (sink, mut rx) = ChannelSink::pair();
    manager.subscribe(SubscribeRequest::new("SELECT ?x WHERE { ?x p ?v }", "c1"), Arc::new(sink)).await?;
    drain(&mut rx);

    let response = manager.update(UpdateRequest::new("INSERT DATA { b p 2 }")).await?;
    assert!(response.is_success());
    let received = drain(&mut rx);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].event, NotificationEvent::Added { bindings: solutions(&[&[("x", "b")]]) });

    manager.update(UpdateRequest::new("DELETE DATA { a p 1 }")).await?;
    let received = drain(&mut rx);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].event, NotificationEvent::Removed { bindings: solutions(&[&[("x", "a")]]) });

    // an update that changes nothing for the predicate emits nothing
    manager.update(UpdateRequest::new("INSERT DATA { b p 2 }")).await?;
    assert!(drain(&mut rx).is_empty());
    Ok(())
}

#[tokio::test]
async fn equal_fingerprints_share_one_spu() -> anyhow::Result<()> {
    let endpoint = Arc::new(MemoryEndpoint::with_triples(&[("a", "p", "1")]));
    let manager = SpuManager::new(endpoint, BrokerConfig::new());

    let (sink1, mut rx1) = ChannelSink::pair();
    let (sink2, mut rx2) = ChannelSink::pair();
    let first = manager.subscribe(SubscribeRequest::new("SELECT ?x WHERE { ?x p ?v }", "c1"), Arc::new(sink1)).await?;
    let second = manager.subscribe(SubscribeRequest::new("SELECT ?x WHERE { ?x p ?v }", "c2"), Arc::new(sink2)).await?;

    assert_eq!(first.spuid, second.spuid);
    assert_ne!(first.sid, second.sid);
    assert_eq!(manager.active_spus(), 1);
    assert_eq!(manager.active_subscribers(), 2);
    drain(&mut rx1);
    drain(&mut rx2);

    manager.update(UpdateRequest::new("INSERT DATA { b p 2 }")).await?;

    // one barrier, identical notifications to both clients
    let to_first = drain(&mut rx1);
    let to_second = drain(&mut rx2);
    assert_eq!(to_first.len(), 1);
    assert_eq!(to_first, to_second);
    Ok(())
}

#[tokio::test]
async fn slow_spu_times_out_the_pre_barrier_without_mutating() -> anyhow::Result<()> {
    common::init_tracing();
    let endpoint = Arc::new(MemoryEndpoint::with_triples(&[("a", "p", "1")]));
    let policy = Arc::new(SleepyPolicy::new("slow", Duration::from_secs(1)));
    let config = BrokerConfig::new().with_spu_processing_timeout(Duration::from_millis(10));
    let manager = SpuManager::with_collaborators(endpoint.clone(), config, policy, Arc::new(()));

    let mut receivers = Vec::new();
    for i in 0..10 {
        let (sink, rx) = ChannelSink::pair();
        let mut request = SubscribeRequest::new(format!("SELECT ?x WHERE {{ ?x p{i} ?v }}"), "c1");
        if i == 0 {
            request = request.with_alias("slow");
        }
        manager.subscribe(request, Arc::new(sink)).await?;
        receivers.push(rx);
    }
    assert_eq!(manager.active_spus(), 10);

    let err = manager.update(UpdateRequest::new("INSERT DATA { b p 2 }")).await.unwrap_err();
    assert!(matches!(err, UpdateError::Timeout { phase: BarrierPhase::Pre }));

    // the endpoint was never touched
    let results = manager.query(QueryRequest::new("SELECT ?x WHERE { ?x p 2 }")).await?;
    assert!(results.is_empty());
    assert_eq!(endpoint.triple_count(), 1);
    assert_eq!(manager.metrics().pre_timeouts, 1);

    // the straggler acknowledges long after the pool was abandoned; the
    // manager ignores it and the next update goes through
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let response = manager.update(UpdateRequest::new("INSERT DATA { b p 2 }")).await?;
    assert!(response.is_success());
    assert_eq!(endpoint.triple_count(), 2);
    Ok(())
}

#[tokio::test]
async fn unsubscribe_unlinks_everything_and_updates_proceed() -> anyhow::Result<()> {
    let endpoint = Arc::new(MemoryEndpoint::with_triples(&[("a", "p", "1")]));
    let manager = SpuManager::new(endpoint.clone(), BrokerConfig::new());

    let (sink, mut rx) = ChannelSink::pair();
    let gid = Gid::from("c1");
    let response = manager.subscribe(SubscribeRequest::new("SELECT ?x WHERE { ?x p ?v }", "c1"), Arc::new(sink)).await?;
    assert_eq!(manager.active_spus(), 1);

    let confirmed = manager.unsubscribe(&response.sid, &gid).await?;
    assert_eq!(confirmed.sid, response.sid);
    assert_eq!(manager.active_spus(), 0);
    assert_eq!(manager.active_subscribers(), 0);

    let received = drain(&mut rx);
    assert_eq!(received.last().map(|n| n.event.clone()), Some(NotificationEvent::Terminated { reason: TerminationReason::Unsubscribed }));

    // an update with an empty active set skips the barriers entirely
    let update = manager.update(UpdateRequest::new("INSERT DATA { b p 2 }")).await?;
    assert!(update.is_success());
    assert_eq!(endpoint.triple_count(), 2);

    // the sid is gone from every table
    assert!(matches!(manager.unsubscribe(&response.sid, &gid).await, Err(UnsubscribeError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn notification_sequences_are_strictly_increasing_and_gapless() -> anyhow::Result<()> {
    let endpoint = Arc::new(MemoryEndpoint::with_triples(&[("a", "p", "1")]));
    let manager = SpuManager::new(endpoint, BrokerConfig::new());

    let (sink, mut rx) = ChannelSink::pair();
    let gid = Gid::from("c1");
    let response = manager.subscribe(SubscribeRequest::new("SELECT ?x WHERE { ?x p ?v }", "c1"), Arc::new(sink)).await?;

    manager.update(UpdateRequest::new("INSERT DATA { b p 2 }")).await?;
    // one barrier producing both an addition and a removal: Added first
    manager.update(UpdateRequest::new("DELETE DATA { a p 1 } ; INSERT DATA { c p 3 }")).await?;
    manager.unsubscribe(&response.sid, &gid).await?;

    let received = drain(&mut rx);
    let events: Vec<&NotificationEvent> = received.iter().map(|n| &n.event).collect();
    assert_eq!(
        events,
        vec![
            &NotificationEvent::InitialSnapshot { bindings: solutions(&[&[("x", "a")]]) },
            &NotificationEvent::Added { bindings: solutions(&[&[("x", "b")]]) },
            &NotificationEvent::Added { bindings: solutions(&[&[("x", "c")]]) },
            &NotificationEvent::Removed { bindings: solutions(&[&[("x", "a")]]) },
            &NotificationEvent::Terminated { reason: TerminationReason::Unsubscribed },
        ]
    );
    let sequences: Vec<u64> = received.iter().map(|n| n.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    assert!(received.iter().all(|n| n.spuid == response.spuid));
    Ok(())
}

#[tokio::test]
async fn reevaluation_failure_keeps_the_spu_alive() -> anyhow::Result<()> {
    let endpoint = Arc::new(MemoryEndpoint::with_triples(&[("a", "p", "1")]));
    let manager = SpuManager::new(endpoint.clone(), BrokerConfig::new());

    let (sink, mut rx) = ChannelSink::pair();
    manager.subscribe(SubscribeRequest::new("SELECT ?x WHERE { ?x p ?v }", "c1"), Arc::new(sink)).await?;
    drain(&mut rx);

    // the mutation applies but the diff query fails: no deltas this cycle
    endpoint.fail_next_queries(1);
    let response = manager.update(UpdateRequest::new("INSERT DATA { b p 2 }")).await?;
    assert!(response.is_success());
    assert!(drain(&mut rx).is_empty());
    assert_eq!(manager.metrics().spu_exceptions, 1);

    // the next cycle diffs against the last good result set and catches up
    manager.update(UpdateRequest::new("INSERT DATA { c p 3 }")).await?;
    let received = drain(&mut rx);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].event, NotificationEvent::Added { bindings: solutions(&[&[("x", "b")], &[("x", "c")]]) });
    Ok(())
}

#[tokio::test]
async fn failed_mutation_emits_no_deltas() -> anyhow::Result<()> {
    let endpoint = Arc::new(MemoryEndpoint::with_triples(&[("a", "p", "1")]));
    let manager = SpuManager::new(endpoint.clone(), BrokerConfig::new());

    let (sink, mut rx) = ChannelSink::pair();
    manager.subscribe(SubscribeRequest::new("SELECT ?x WHERE { ?x p ?v }", "c1"), Arc::new(sink)).await?;
    drain(&mut rx);

    endpoint.fail_next_updates(1);
    let err = manager.update(UpdateRequest::new("INSERT DATA { b p 2 }")).await.unwrap_err();
    assert!(matches!(err, UpdateError::Endpoint(_)));
    assert!(drain(&mut rx).is_empty());
    assert_eq!(endpoint.triple_count(), 1);
    Ok(())
}

#[tokio::test]
async fn retry_budget_reapplies_failed_mutations() -> anyhow::Result<()> {
    let endpoint = Arc::new(MemoryEndpoint::with_triples(&[("a", "p", "1")]));
    let manager = SpuManager::new(endpoint.clone(), BrokerConfig::new().with_endpoint_retry_budget(2));

    endpoint.fail_next_updates(2);
    let response = manager.update(UpdateRequest::new("INSERT DATA { b p 2 }")).await?;
    assert!(response.is_success());
    assert_eq!(endpoint.triple_count(), 2);
    assert_eq!(manager.metrics().endpoint_retries, 2);
    Ok(())
}

#[tokio::test]
async fn query_passthrough_answers_from_the_endpoint() -> anyhow::Result<()> {
    let endpoint = Arc::new(MemoryEndpoint::with_triples(&[("a", "p", "1"), ("b", "q", "2")]));
    let manager = SpuManager::new(endpoint, BrokerConfig::new());

    let results = manager.query(QueryRequest::new("SELECT ?x WHERE { ?x q ?v }")).await?;
    assert_eq!(results, solutions(&[&[("x", "b")]]));
    assert_eq!(manager.metrics().queries_total, 1);
    Ok(())
}
