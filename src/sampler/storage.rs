//! Buffered-span storage backing the tail sampler.
//!
//! `TraceStore` holds single-span snapshots keyed by (trace, span).
//! `DecisionQueue` is the per-stream bounded index from trace ID to the
//! pending span IDs buffered for it. `SpanBuffer` composes the two under
//! the configured storage policy.

use super::config::StoragePolicy;
use crate::record::{SpanId, TraceBatch, TraceId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error};

/// Unique key for one buffered span snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceKey {
    /// Owning trace.
    pub trace_id: TraceId,
    /// Span within the trace.
    pub span_id: SpanId,
}

impl TraceKey {
    /// Create a new key.
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self { trace_id, span_id }
    }
}

/// Concurrent store of buffered single-span snapshots.
///
/// Entries are created on buffer and destroyed exactly once on `pop`.
#[derive(Debug, Default)]
pub struct TraceStore {
    entries: RwLock<HashMap<TraceKey, TraceBatch>>,
}

impl TraceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a snapshot, replacing any previous entry for the key.
    pub fn put(&self, key: TraceKey, snapshot: TraceBatch) {
        self.entries.write().unwrap().insert(key, snapshot);
    }

    /// Remove and return the snapshot for the key, if present.
    pub fn pop(&self, key: &TraceKey) -> Option<TraceBatch> {
        self.entries.write().unwrap().remove(key)
    }

    /// Drop an entry without returning it.
    pub fn remove(&self, key: &TraceKey) {
        self.entries.write().unwrap().remove(key);
    }

    /// Number of buffered snapshots.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release all state.
    pub fn clean(&self) {
        self.entries.write().unwrap().clear();
    }
}

/// Pending span IDs for the traces of one data stream.
#[derive(Debug, Default)]
struct StreamIndex {
    pending: Mutex<HashMap<TraceId, VecDeque<SpanId>>>,
}

impl StreamIndex {
    /// Register a span ID under its trace, evicting the oldest pending
    /// entry when the per-trace bound is reached.
    fn push(&self, trace_id: TraceId, span_id: SpanId, cap: usize) -> Option<SpanId> {
        let mut pending = self.pending.lock().unwrap();
        let queue = pending.entry(trace_id).or_default();

        let evicted = if queue.len() >= cap {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(span_id);
        evicted
    }

    /// Remove and return every pending span ID for the trace.
    fn drain(&self, trace_id: &TraceId) -> Vec<SpanId> {
        let mut pending = self.pending.lock().unwrap();
        pending
            .remove(trace_id)
            .map(Vec::from)
            .unwrap_or_default()
    }
}

/// Per-stream bounded index from trace ID to pending span IDs.
///
/// Stream indexes are created lazily on first use; concurrent first access
/// checks under the read lock, then re-checks under the write lock, so a
/// stream is never created twice.
#[derive(Debug)]
pub struct DecisionQueue {
    streams: RwLock<HashMap<i64, Arc<StreamIndex>>>,
    max_spans_per_trace: usize,
}

impl DecisionQueue {
    /// Create an index with the given per-trace capacity.
    pub fn new(max_spans_per_trace: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            max_spans_per_trace: max_spans_per_trace.max(1),
        }
    }

    fn stream(&self, stream_id: i64) -> Arc<StreamIndex> {
        if let Some(index) = self.streams.read().unwrap().get(&stream_id) {
            return Arc::clone(index);
        }

        let mut streams = self.streams.write().unwrap();
        Arc::clone(streams.entry(stream_id).or_default())
    }

    /// Register a pending span. Returns the span ID evicted to make room,
    /// if the trace was already at capacity.
    pub fn push(&self, stream_id: i64, trace_id: TraceId, span_id: SpanId) -> Option<SpanId> {
        self.stream(stream_id)
            .push(trace_id, span_id, self.max_spans_per_trace)
    }

    /// Remove and return every pending span ID for the trace under the
    /// stream. Empty when nothing was buffered.
    pub fn drain(&self, stream_id: i64, trace_id: &TraceId) -> Vec<SpanId> {
        match self.streams.read().unwrap().get(&stream_id) {
            Some(index) => index.drain(trace_id),
            None => Vec::new(),
        }
    }

    /// Number of lazily-created stream indexes.
    pub fn stream_count(&self) -> usize {
        self.streams.read().unwrap().len()
    }

    /// Release all state.
    pub fn clean(&self) {
        self.streams.write().unwrap().clear();
    }
}

/// Policy-aware buffering facade over `TraceStore` + `DecisionQueue`.
#[derive(Debug)]
pub struct SpanBuffer {
    policy: StoragePolicy,
    store: TraceStore,
    queue: DecisionQueue,
}

impl SpanBuffer {
    /// Create a buffer for the given policy and per-trace bound.
    pub fn new(policy: StoragePolicy, max_spans_per_trace: usize) -> Self {
        Self {
            policy,
            store: TraceStore::new(),
            queue: DecisionQueue::new(max_spans_per_trace),
        }
    }

    /// The active storage policy.
    pub fn policy(&self) -> StoragePolicy {
        self.policy
    }

    /// Number of spans currently buffered.
    pub fn buffered_spans(&self) -> usize {
        self.store.len()
    }

    /// Buffer a single-span snapshot under its stream.
    ///
    /// A no-op unless the active policy is `full`. The (trace, span) key is
    /// derived from the snapshot; snapshots without extractable identifiers
    /// are skipped. Returns whether the snapshot was stored.
    pub fn put(&self, stream_id: i64, snapshot: TraceBatch) -> bool {
        if self.policy != StoragePolicy::Full {
            return false;
        }

        let Some(span) = snapshot.spans().next() else {
            debug!(stream_id, "skipping empty span snapshot");
            return false;
        };
        if !span.has_valid_ids() {
            debug!(stream_id, "skipping span snapshot without valid ids");
            return false;
        }

        let key = TraceKey::new(span.trace_id, span.span_id);
        if let Some(evicted) = self.queue.push(stream_id, key.trace_id, key.span_id) {
            debug!(
                stream_id,
                trace_id = %key.trace_id,
                span_id = %evicted,
                "pending-span bound reached, evicting oldest buffered span"
            );
            self.store.remove(&TraceKey::new(key.trace_id, evicted));
        }
        self.store.put(key, snapshot);
        true
    }

    /// Atomically drain every buffered snapshot for the trace under the
    /// stream. Index entries whose payload is missing from the store are
    /// logged and skipped.
    pub fn pop(&self, stream_id: i64, trace_id: &TraceId) -> Vec<TraceBatch> {
        let span_ids = self.queue.drain(stream_id, trace_id);
        let mut out = Vec::with_capacity(span_ids.len());

        for span_id in span_ids {
            let key = TraceKey::new(*trace_id, span_id);
            match self.store.pop(&key) {
                Some(snapshot) => out.push(snapshot),
                None => {
                    error!(
                        stream_id,
                        trace_id = %trace_id,
                        span_id = %span_id,
                        "buffered span missing from trace store, skipping"
                    );
                },
            }
        }
        out
    }

    /// Release all state.
    pub fn clean(&self) {
        self.queue.clean();
        self.store.clean();
    }
}
