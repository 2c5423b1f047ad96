//! Integration tests for the cluster forwarding layer.

use chrono::Utc;
use span_relay::cluster::{
    ClusterClient, ClusterConfig, ClusterError, ClusterResult, ForwardHandler, ForwardService,
    HashRing, ResolverConfig, ResolverType,
};
use span_relay::record::{
    RecordType, ResourceSpans, ScopeSpans, Span, SpanId, SpanKind, SpanStatus, StatusCode,
    TraceBatch, TraceId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingHandler {
    batches: AtomicUsize,
    trace_ids: Mutex<Vec<TraceId>>,
}

impl ForwardHandler for RecordingHandler {
    fn handle(&self, _record_type: RecordType, batch: TraceBatch) -> ClusterResult<()> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if let Some(trace_id) = batch.first_trace_id() {
            self.trace_ids.lock().unwrap().push(trace_id);
        }
        Ok(())
    }
}

fn make_batch(traces: &[u64]) -> TraceBatch {
    TraceBatch {
        resource_spans: vec![ResourceSpans {
            resource: HashMap::new(),
            scope_spans: vec![ScopeSpans {
                scope: "integration".to_string(),
                spans: traces
                    .iter()
                    .enumerate()
                    .map(|(i, trace)| Span {
                        trace_id: TraceId::new(0, *trace),
                        span_id: SpanId::new(i as u64 + 1),
                        parent_span_id: SpanId::invalid(),
                        name: "op".to_string(),
                        kind: SpanKind::Client,
                        start_time: Utc::now(),
                        end_time: Utc::now(),
                        status: SpanStatus::from_code(StatusCode::Ok),
                        attributes: HashMap::new(),
                    })
                    .collect(),
            }],
        }],
    }
}

fn static_config(identifier: &str, endpoints: Vec<String>) -> ClusterConfig {
    ClusterConfig {
        resolver: ResolverConfig {
            resolver_type: ResolverType::Static,
            identifier: identifier.to_string(),
            endpoints,
        },
        ..ClusterConfig::default()
    }
}

#[tokio::test]
async fn local_only_cluster_dispatches_in_process() {
    // Spec scenario: identifier ":1001", endpoints [":1001"]. Nothing is
    // listening on that address; every forward must stay in-process.
    let handler = Arc::new(RecordingHandler::default());
    let config = static_config(":1001", vec![":1001".to_string()]);
    let mut client = ClusterClient::new(&config, handler.clone()).await.unwrap();

    for trace in [1u64, 2, 3] {
        client.forward_traces(&make_batch(&[trace])).await.unwrap();
    }

    assert_eq!(handler.batches.load(Ordering::SeqCst), 3);
    assert_eq!(client.stats().forwarded_local.load(Ordering::Relaxed), 3);
    assert_eq!(client.stats().forwarded_remote.load(Ordering::Relaxed), 0);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn two_node_cluster_routes_between_self_and_peer() {
    // Peer node with a live forward service.
    let peer_handler = Arc::new(RecordingHandler::default());
    let mut peer_service = ForwardService::new("127.0.0.1:0");
    peer_service
        .start(peer_handler.clone() as Arc<dyn ForwardHandler>)
        .await
        .unwrap();
    let peer_addr = peer_service.local_addr().unwrap().to_string();

    // Local node: member of a two-node cluster.
    let local_handler = Arc::new(RecordingHandler::default());
    let identifier = ":1001";
    let config = static_config(
        identifier,
        vec![identifier.to_string(), peer_addr.clone()],
    );
    let mut client = ClusterClient::new(&config, local_handler.clone())
        .await
        .unwrap();
    assert_eq!(client.members().len(), 2);

    // Forward many distinct traces; each lands on exactly one node, and
    // both nodes end up owning some share.
    for trace in 1..=60u64 {
        client.forward_traces(&make_batch(&[trace])).await.unwrap();
    }

    let local = local_handler.batches.load(Ordering::SeqCst);
    let remote = peer_handler.batches.load(Ordering::SeqCst);
    assert_eq!(local + remote, 60);
    assert!(local > 0, "local node received no traces");
    assert!(remote > 0, "peer node received no traces");

    client.stop().await.unwrap();
    peer_service.stop().await;
}

#[tokio::test]
async fn routing_is_stable_per_trace() {
    let peer_handler = Arc::new(RecordingHandler::default());
    let mut peer_service = ForwardService::new("127.0.0.1:0");
    peer_service
        .start(peer_handler.clone() as Arc<dyn ForwardHandler>)
        .await
        .unwrap();
    let peer_addr = peer_service.local_addr().unwrap().to_string();

    let local_handler = Arc::new(RecordingHandler::default());
    let config = static_config(":1001", vec![":1001".to_string(), peer_addr]);
    let mut client = ClusterClient::new(&config, local_handler.clone())
        .await
        .unwrap();

    // The same trace always lands on the same node.
    for _ in 0..10 {
        client.forward_traces(&make_batch(&[42])).await.unwrap();
    }
    let local = local_handler.batches.load(Ordering::SeqCst);
    let remote = peer_handler.batches.load(Ordering::SeqCst);
    assert!(
        (local == 10 && remote == 0) || (local == 0 && remote == 10),
        "trace 42 split across nodes: local={local} remote={remote}"
    );

    client.stop().await.unwrap();
    peer_service.stop().await;
}

#[tokio::test]
async fn mixed_batch_splits_per_trace() {
    let handler = Arc::new(RecordingHandler::default());
    let config = static_config(":1001", vec![":1001".to_string()]);
    let mut client = ClusterClient::new(&config, handler.clone()).await.unwrap();

    // One incoming batch mixing three traces becomes three dispatches.
    client
        .forward_traces(&make_batch(&[1, 2, 3, 1]))
        .await
        .unwrap();
    assert_eq!(handler.batches.load(Ordering::SeqCst), 3);

    let seen: Vec<TraceId> = handler.trace_ids.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn noop_resolver_leaves_ring_empty() {
    let handler = Arc::new(RecordingHandler::default());
    let mut client = ClusterClient::new(&ClusterConfig::default(), handler)
        .await
        .unwrap();

    assert!(client.members().is_empty());
    assert!(matches!(
        client.forward_traces(&make_batch(&[7])).await,
        Err(ClusterError::EmptyRing)
    ));

    client.stop().await.unwrap();
}

#[test]
fn picker_minimal_disruption_property() {
    let mut ring = HashRing::new();
    ring.add_member("a:4316");
    ring.add_member("b:4316");

    let batch = make_batch(&[42]);
    let picked = ring.pick_traces(&batch).unwrap();

    // Removing the picked member reroutes to the other one, never back.
    ring.remove_member(&picked);
    let repicked = ring.pick_traces(&batch).unwrap();
    assert_ne!(repicked, picked);

    for _ in 0..10 {
        assert_eq!(ring.pick_traces(&batch).unwrap(), repicked);
    }
}
