//! Cluster client: owns per-member connections and forwards trace batches.

use super::config::ClusterConfig;
use super::error::{ClusterError, ClusterResult};
use super::resolver::{new_resolver, Resolver};
use super::ring::HashRing;
use super::notifier::EndpointEvent;
use super::service::ForwardHandler;
use super::wire::{read_frame, write_frame, ForwardRequest, ForwardResponse};
use crate::record::{RecordType, TraceBatch};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Counters for the cluster client.
#[derive(Debug, Default)]
pub struct ClientStats {
    /// Sub-batches dispatched through the in-process local path.
    pub forwarded_local: AtomicU64,
    /// Sub-batches dispatched over the wire.
    pub forwarded_remote: AtomicU64,
    /// Dial attempts that failed.
    pub dial_failures: AtomicU64,
    /// Forward calls that returned an error.
    pub forward_errors: AtomicU64,
}

/// A persistent framed connection to one remote member.
///
/// The underlying stream is re-established lazily after an error.
#[derive(Debug)]
struct RemoteConn {
    endpoint: String,
    stream: tokio::sync::Mutex<Option<TcpStream>>,
}

impl RemoteConn {
    fn new(endpoint: impl Into<String>, stream: TcpStream) -> Self {
        Self {
            endpoint: endpoint.into(),
            stream: tokio::sync::Mutex::new(Some(stream)),
        }
    }

    /// Send one forward call and wait for its response.
    async fn call(&self, request: &ForwardRequest) -> ClusterResult<ForwardResponse> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.endpoint)
                .await
                .map_err(|e| ClusterError::DialFailed(self.endpoint.clone(), e.to_string()))?;
            *guard = Some(stream);
        }
        let stream = guard.as_mut().unwrap();

        let result: ClusterResult<ForwardResponse> = async {
            write_frame(stream, &request.to_bytes()?).await?;
            let body = read_frame(stream).await?;
            ForwardResponse::from_bytes(&body)
        }
        .await;

        if result.is_err() {
            // Connection state is unknown after a failed exchange.
            *guard = None;
        }
        result
    }

    async fn close(&self) -> ClusterResult<()> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

/// One connection handle per known member.
#[derive(Clone)]
enum Connection {
    /// In-process handle for the self identifier; invokes the inbound
    /// handler directly with no network hop or re-serialization.
    Local(Arc<dyn ForwardHandler>),
    /// Framed TCP connection to a remote member.
    Remote(Arc<RemoteConn>),
}

/// Ring and connection maps, mutated atomically under one lock.
struct State {
    ring: HashRing,
    conns: HashMap<String, Connection>,
    not_ready: HashSet<String>,
}

struct Shared {
    identifier: String,
    handler: Arc<dyn ForwardHandler>,
    dial_timeout: Duration,
    state: Mutex<State>,
    stats: ClientStats,
}

/// Cluster forwarder.
///
/// Reacts to resolver membership events, keeps one connection per member
/// (local or remote), retries unreachable members on a fixed schedule, and
/// routes per-trace sub-batches through the consistent-hash ring.
pub struct ClusterClient {
    shared: Arc<Shared>,
    resolver: Box<dyn Resolver>,
    stop_tx: watch::Sender<bool>,
    event_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
}

impl ClusterClient {
    /// Build a client from configuration and start its background loops.
    ///
    /// Membership already announced by the resolver (the static resolver
    /// synchronizes at construction) is applied before this returns.
    pub async fn new(
        config: &ClusterConfig,
        handler: Arc<dyn ForwardHandler>,
    ) -> ClusterResult<Self> {
        let resolver = new_resolver(&config.resolver);
        let mut events = resolver.watch()?;

        let shared = Arc::new(Shared {
            identifier: config.resolver.identifier.clone(),
            handler,
            dial_timeout: config.dial_timeout,
            state: Mutex::new(State {
                ring: HashRing::new(),
                conns: HashMap::new(),
                not_ready: HashSet::new(),
            }),
            stats: ClientStats::default(),
        });

        while let Ok(event) = events.try_recv() {
            apply_event(&shared, event).await;
        }

        let (stop_tx, stop_rx) = watch::channel(false);

        let event_shared = Arc::clone(&shared);
        let mut event_stop = stop_rx.clone();
        let event_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => apply_event(&event_shared, event).await,
                        None => break,
                    },
                    _ = event_stop.changed() => break,
                }
            }
        });

        let retry_shared = Arc::clone(&shared);
        let mut retry_stop = stop_rx;
        let retry_interval = config.retry_interval;
        let retry_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retry_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => retry_not_ready(&retry_shared).await,
                    _ = retry_stop.changed() => break,
                }
            }
        });

        info!(
            resolver = resolver.kind(),
            identifier = %config.resolver.identifier,
            "cluster client started"
        );

        Ok(Self {
            shared,
            resolver,
            stop_tx,
            event_task: Some(event_task),
            retry_task: Some(retry_task),
        })
    }

    /// Client counters.
    pub fn stats(&self) -> &ClientStats {
        &self.shared.stats
    }

    /// Current ring members.
    pub fn members(&self) -> Vec<String> {
        self.shared.state.lock().unwrap().ring.members().to_vec()
    }

    /// Endpoints currently parked for retry.
    pub fn not_ready(&self) -> Vec<String> {
        let state = self.shared.state.lock().unwrap();
        state.not_ready.iter().cloned().collect()
    }

    /// Split the batch per trace, route each sub-batch through the ring,
    /// and dispatch synchronously.
    ///
    /// Returns the first error encountered; no partial-success reporting
    /// and no retry at this layer.
    pub async fn forward_traces(&self, batch: &TraceBatch) -> ClusterResult<()> {
        let parts = batch.split_by_trace();
        if parts.is_empty() {
            return Err(ClusterError::NoRoutingKey);
        }

        for (trace_id, sub_batch) in parts {
            let (endpoint, conn) = {
                let state = self.shared.state.lock().unwrap();
                let endpoint = state.ring.pick_traces(&sub_batch)?;
                let conn = state.conns.get(&endpoint).cloned();
                (endpoint, conn)
            };

            let Some(conn) = conn else {
                self.shared.stats.forward_errors.fetch_add(1, Ordering::Relaxed);
                return Err(ClusterError::ConnectionNotReady(endpoint));
            };

            match conn {
                Connection::Local(handler) => {
                    debug!(trace_id = %trace_id, "dispatching trace locally");
                    if let Err(e) = handler.handle(RecordType::Traces, sub_batch) {
                        self.shared.stats.forward_errors.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                    self.shared
                        .stats
                        .forwarded_local
                        .fetch_add(1, Ordering::Relaxed);
                },
                Connection::Remote(remote) => {
                    debug!(trace_id = %trace_id, endpoint = %endpoint, "forwarding trace");
                    let body = rmp_serde::to_vec(&sub_batch)
                        .map_err(|e| ClusterError::Serialization(e.to_string()))?;
                    let request = ForwardRequest {
                        record_type: RecordType::Traces.as_str().to_string(),
                        body,
                    };

                    let response = match remote.call(&request).await {
                        Ok(response) => response,
                        Err(e) => {
                            self.shared.stats.forward_errors.fetch_add(1, Ordering::Relaxed);
                            return Err(e);
                        },
                    };
                    if !response.is_ok() {
                        self.shared.stats.forward_errors.fetch_add(1, Ordering::Relaxed);
                        return Err(ClusterError::Rejected(endpoint, response.message));
                    }
                    self.shared
                        .stats
                        .forwarded_remote
                        .fetch_add(1, Ordering::Relaxed);
                },
            }
        }

        Ok(())
    }

    /// Stop the background loops (awaited before returning), close every
    /// owned connection, and report the first close error.
    pub async fn stop(&mut self) -> ClusterResult<()> {
        self.resolver.stop();
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.event_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.retry_task.take() {
            let _ = task.await;
        }

        let conns: Vec<Connection> = {
            let mut state = self.shared.state.lock().unwrap();
            state.not_ready.clear();
            state.conns.drain().map(|(_, conn)| conn).collect()
        };

        let mut first_err = None;
        for conn in conns {
            if let Connection::Remote(remote) = conn {
                if let Err(e) = remote.close().await {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        info!("cluster client stopped");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Apply one membership event to the ring and connection maps.
async fn apply_event(shared: &Arc<Shared>, event: EndpointEvent) {
    match event {
        EndpointEvent::Add(endpoint) => {
            {
                let mut state = shared.state.lock().unwrap();
                state.ring.add_member(&endpoint);
                if endpoint == shared.identifier {
                    state.conns.insert(
                        endpoint.clone(),
                        Connection::Local(Arc::clone(&shared.handler)),
                    );
                    debug!(endpoint = %endpoint, "registered local in-process member");
                    return;
                }
            }
            connect_endpoint(shared, &endpoint).await;
        },
        EndpointEvent::Delete(endpoint) => {
            let conn = {
                let mut state = shared.state.lock().unwrap();
                state.ring.remove_member(&endpoint);
                state.not_ready.remove(&endpoint);
                state.conns.remove(&endpoint)
            };
            if let Some(Connection::Remote(remote)) = conn {
                let _ = remote.close().await;
            }
            debug!(endpoint = %endpoint, "member removed");
        },
    }
}

/// Dial a remote endpoint, registering the connection on success and
/// parking the endpoint as not-ready on failure.
async fn connect_endpoint(shared: &Arc<Shared>, endpoint: &str) {
    match timeout(shared.dial_timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(stream)) => {
            let mut state = shared.state.lock().unwrap();
            // The member may have been deleted while the dial was in
            // flight.
            if !state.ring.contains(endpoint) {
                return;
            }
            state.not_ready.remove(endpoint);
            state.conns.insert(
                endpoint.to_string(),
                Connection::Remote(Arc::new(RemoteConn::new(endpoint, stream))),
            );
            debug!(endpoint = %endpoint, "member connected");
        },
        Ok(Err(e)) => park_endpoint(shared, endpoint, &e.to_string()),
        Err(_) => park_endpoint(shared, endpoint, "dial timeout"),
    }
}

fn park_endpoint(shared: &Arc<Shared>, endpoint: &str, reason: &str) {
    shared.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
    let mut state = shared.state.lock().unwrap();
    if state.ring.contains(endpoint) {
        state.not_ready.insert(endpoint.to_string());
    }
    warn!(endpoint = %endpoint, reason = %reason, "endpoint not ready, will retry");
}

/// Attempt to upgrade every not-ready endpoint to an active connection.
async fn retry_not_ready(shared: &Arc<Shared>) {
    let pending: Vec<String> = {
        let state = shared.state.lock().unwrap();
        state.not_ready.iter().cloned().collect()
    };
    for endpoint in pending {
        connect_endpoint(shared, &endpoint).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::{ResolverConfig, ResolverType};
    use crate::cluster::service::ForwardService;
    use crate::record::{
        ResourceSpans, ScopeSpans, Span, SpanId, SpanKind, SpanStatus, StatusCode, TraceId,
    };
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHandler {
        batches: AtomicUsize,
        spans: AtomicUsize,
    }

    impl ForwardHandler for CountingHandler {
        fn handle(&self, _record_type: RecordType, batch: TraceBatch) -> ClusterResult<()> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.spans.fetch_add(batch.span_count(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_batch(traces: &[u64]) -> TraceBatch {
        TraceBatch {
            resource_spans: vec![ResourceSpans {
                resource: HashMap::new(),
                scope_spans: vec![ScopeSpans {
                    scope: "test".to_string(),
                    spans: traces
                        .iter()
                        .enumerate()
                        .map(|(i, trace)| Span {
                            trace_id: TraceId::new(0, *trace),
                            span_id: SpanId::new(i as u64 + 1),
                            parent_span_id: SpanId::invalid(),
                            name: "op".to_string(),
                            kind: SpanKind::Internal,
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

    fn self_only_config(identifier: &str) -> ClusterConfig {
        ClusterConfig {
            resolver: ResolverConfig {
                resolver_type: ResolverType::Static,
                identifier: identifier.to_string(),
                endpoints: vec![identifier.to_string()],
            },
            ..ClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_local_dispatch_never_dials() {
        // The self endpoint is not listening anywhere; dispatch must stay
        // in-process.
        let handler = Arc::new(CountingHandler::default());
        let mut client = ClusterClient::new(&self_only_config(":1001"), handler.clone())
            .await
            .unwrap();

        client.forward_traces(&make_batch(&[7])).await.unwrap();
        assert_eq!(handler.batches.load(Ordering::SeqCst), 1);
        assert_eq!(client.stats().forwarded_local.load(Ordering::Relaxed), 1);
        assert_eq!(client.stats().forwarded_remote.load(Ordering::Relaxed), 0);

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_splits_per_trace() {
        let handler = Arc::new(CountingHandler::default());
        let mut client = ClusterClient::new(&self_only_config(":1001"), handler.clone())
            .await
            .unwrap();

        client
            .forward_traces(&make_batch(&[1, 2, 1, 3]))
            .await
            .unwrap();
        assert_eq!(handler.batches.load(Ordering::SeqCst), 3);
        assert_eq!(handler.spans.load(Ordering::SeqCst), 4);

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_cluster_fails_fast() {
        let handler = Arc::new(CountingHandler::default());
        let config = ClusterConfig::default();
        let mut client = ClusterClient::new(&config, handler).await.unwrap();

        assert!(matches!(
            client.forward_traces(&make_batch(&[7])).await,
            Err(ClusterError::EmptyRing)
        ));

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_batch_has_no_routing_key() {
        let handler = Arc::new(CountingHandler::default());
        let mut client = ClusterClient::new(&self_only_config(":1001"), handler)
            .await
            .unwrap();

        assert!(matches!(
            client.forward_traces(&TraceBatch::new()).await,
            Err(ClusterError::NoRoutingKey)
        ));

        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_forward_end_to_end() {
        let service_handler = Arc::new(CountingHandler::default());
        let mut service = ForwardService::new("127.0.0.1:0");
        service
            .start(service_handler.clone() as Arc<dyn ForwardHandler>)
            .await
            .unwrap();
        let peer = service.local_addr().unwrap().to_string();

        let local_handler = Arc::new(CountingHandler::default());
        let config = ClusterConfig {
            resolver: ResolverConfig {
                resolver_type: ResolverType::Static,
                identifier: ":1001".to_string(),
                endpoints: vec![peer.clone()],
            },
            ..ClusterConfig::default()
        };
        let mut client = ClusterClient::new(&config, local_handler.clone())
            .await
            .unwrap();

        client.forward_traces(&make_batch(&[7])).await.unwrap();
        assert_eq!(service_handler.batches.load(Ordering::SeqCst), 1);
        assert_eq!(service_handler.spans.load(Ordering::SeqCst), 1);
        assert_eq!(local_handler.batches.load(Ordering::SeqCst), 0);
        assert_eq!(client.stats().forwarded_remote.load(Ordering::Relaxed), 1);

        client.stop().await.unwrap();
        service.stop().await;
    }

    #[tokio::test]
    async fn test_dial_failure_parks_and_retry_upgrades() {
        // Reserve an address, then drop the listener so the first dial
        // fails.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let handler = Arc::new(CountingHandler::default());
        let config = ClusterConfig {
            resolver: ResolverConfig {
                resolver_type: ResolverType::Static,
                identifier: ":1001".to_string(),
                endpoints: vec![addr.clone()],
            },
            retry_interval: Duration::from_millis(50),
            ..ClusterConfig::default()
        };
        let mut client = ClusterClient::new(&config, handler.clone()).await.unwrap();

        assert_eq!(client.not_ready(), vec![addr.clone()]);
        assert!(matches!(
            client.forward_traces(&make_batch(&[7])).await,
            Err(ClusterError::ConnectionNotReady(_))
        ));

        // Bring the peer up; the retry loop should connect to it.
        let service_handler = Arc::new(CountingHandler::default());
        let mut service = ForwardService::new(addr.clone());
        service
            .start(service_handler.clone() as Arc<dyn ForwardHandler>)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(client.not_ready().is_empty());

        client.forward_traces(&make_batch(&[7])).await.unwrap();
        assert_eq!(service_handler.batches.load(Ordering::SeqCst), 1);

        client.stop().await.unwrap();
        service.stop().await;
    }
}
