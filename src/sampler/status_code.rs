//! Tail sampling keyed on span status codes.

use super::config::{SamplerConfig, StoragePolicy};
use super::error::{SampleError, SampleResult};
use super::evaluator::Evaluator;
use super::storage::SpanBuffer;
use crate::record::{Record, RecordType, Span, TraceId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Counters for the tail sampler.
#[derive(Debug, Default)]
pub struct SamplerStats {
    /// Batches evaluated.
    pub batches: AtomicU64,
    /// Spans emitted downstream.
    pub spans_kept: AtomicU64,
    /// Spans buffered pending a decision.
    pub spans_buffered: AtomicU64,
    /// Buffered spans replayed into a batch.
    pub spans_replayed: AtomicU64,
    /// Spans discarded with no possibility of replay.
    pub spans_discarded: AtomicU64,
}

/// Map of trace ID to the instant its keep decision was last refreshed.
type DecisionMap = Arc<RwLock<HashMap<TraceId, Instant>>>;

/// Evaluator that keeps whole traces once a span with a must-keep status
/// is observed.
///
/// Spans arriving before their trace's decision are buffered (policy
/// `full`) or discarded (policy `post`); buffered spans are replayed into
/// the first batch that observes the trace after it is marked keep. A
/// background reclaim thread expires decisions for traces that stay
/// inactive longer than the configured duration.
pub struct StatusCodeEvaluator {
    keep_codes: HashSet<String>,
    policy: StoragePolicy,
    max_duration: Duration,
    decisions: DecisionMap,
    buffer: SpanBuffer,
    stats: SamplerStats,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    reclaim_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for StatusCodeEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusCodeEvaluator")
            .field("keep_codes", &self.keep_codes)
            .field("policy", &self.policy)
            .field("max_duration", &self.max_duration)
            .finish()
    }
}

impl StatusCodeEvaluator {
    /// Create a new evaluator and start its reclaim loop.
    pub fn new(config: &SamplerConfig) -> Self {
        let keep_codes: HashSet<String> = config
            .status_codes
            .iter()
            .map(|c| c.to_uppercase())
            .collect();
        let decisions: DecisionMap = Arc::new(RwLock::new(HashMap::new()));

        let (stop_tx, stop_rx) = mpsc::channel();
        let reclaim_decisions = Arc::clone(&decisions);
        let interval = config.reclaim_interval;
        let max_duration = config.max_duration;
        let handle = thread::spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let removed = reclaim_expired(&reclaim_decisions, max_duration);
                        if removed > 0 {
                            debug!(removed, "reclaimed inactive trace decisions");
                        }
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Self {
            keep_codes,
            policy: config.storage_policy,
            max_duration,
            decisions,
            buffer: SpanBuffer::new(config.storage_policy, config.max_spans_per_trace),
            stats: SamplerStats::default(),
            stop_tx: Mutex::new(Some(stop_tx)),
            reclaim_handle: Mutex::new(Some(handle)),
        }
    }

    /// Sampler counters.
    pub fn stats(&self) -> &SamplerStats {
        &self.stats
    }

    /// Number of traces currently marked keep.
    pub fn decision_count(&self) -> usize {
        self.decisions.read().unwrap().len()
    }

    /// Expire decisions older than the configured inactivity duration.
    ///
    /// Called periodically by the reclaim loop; public so an expiry pass
    /// can be forced.
    pub fn reclaim(&self) -> usize {
        reclaim_expired(&self.decisions, self.max_duration)
    }

    fn status_matches(&self, span: &Span) -> bool {
        self.keep_codes.contains(span.status.code.label())
    }
}

fn reclaim_expired(decisions: &RwLock<HashMap<TraceId, Instant>>, max_duration: Duration) -> usize {
    let now = Instant::now();
    let mut map = decisions.write().unwrap();
    let before = map.len();
    map.retain(|_, refreshed| now.duration_since(*refreshed) < max_duration);
    before - map.len()
}

impl Evaluator for StatusCodeEvaluator {
    fn evaluate(&self, record: &mut Record) -> SampleResult<()> {
        if record.record_type != RecordType::Traces {
            return Ok(());
        }

        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        let stream_id = record.token.data_id;
        let trace_ids = record.data.trace_ids();

        // Traces already decided before this batch arrived. Their spans
        // pass the filter untouched.
        let decided_before: HashSet<TraceId> = {
            let decisions = self.decisions.read().unwrap();
            trace_ids
                .iter()
                .filter(|t| decisions.contains_key(*t))
                .copied()
                .collect()
        };

        // Refresh pass, completed before filtering so intra-batch span
        // ordering cannot affect the outcome.
        let refreshed: HashSet<TraceId> = record
            .data
            .spans()
            .filter(|s| s.trace_id.is_valid() && self.status_matches(s))
            .map(|s| s.trace_id)
            .collect();
        if !refreshed.is_empty() {
            let now = Instant::now();
            let mut decisions = self.decisions.write().unwrap();
            for trace_id in &refreshed {
                decisions.insert(*trace_id, now);
            }
        }

        // Single-span snapshots of the spans the filter is about to drop,
        // kept around for buffering under the full policy.
        let snapshots = if self.policy == StoragePolicy::Full {
            record
                .data
                .single_span_snapshots()
                .into_iter()
                .filter(|snap| match snap.spans().next() {
                    Some(s) => {
                        s.has_valid_ids()
                            && !self.status_matches(s)
                            && !decided_before.contains(&s.trace_id)
                    },
                    None => false,
                })
                .collect()
        } else {
            Vec::new()
        };

        let before = record.data.span_count();
        record
            .data
            .retain_spans(|s| self.status_matches(s) || decided_before.contains(&s.trace_id));
        let removed = before - record.data.span_count();

        // Replay previously buffered spans for every trace in this batch
        // that now has a keep decision. Pop deletes what it returns, so a
        // snapshot is never delivered twice.
        let decided_now: HashSet<&TraceId> = trace_ids
            .iter()
            .filter(|t| decided_before.contains(*t) || refreshed.contains(*t))
            .collect();
        let mut replayed = 0u64;
        for trace_id in decided_now {
            for popped in self.buffer.pop(stream_id, trace_id) {
                replayed += popped.span_count() as u64;
                record.data.merge(popped);
            }
        }

        match self.policy {
            StoragePolicy::Full => {
                let mut buffered = 0u64;
                for snapshot in snapshots {
                    if self.buffer.put(stream_id, snapshot) {
                        buffered += 1;
                    }
                }
                self.stats.spans_buffered.fetch_add(buffered, Ordering::Relaxed);
            },
            StoragePolicy::Post => {
                self.stats
                    .spans_discarded
                    .fetch_add(removed as u64, Ordering::Relaxed);
            },
        }

        self.stats.spans_replayed.fetch_add(replayed, Ordering::Relaxed);
        self.stats
            .spans_kept
            .fetch_add(record.data.span_count() as u64, Ordering::Relaxed);

        if record.data.is_empty() {
            return Err(SampleError::Skip);
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "status_code"
    }

    /// Stop the reclaim loop (joined before returning) and release all
    /// buffered state.
    fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.reclaim_handle.lock().unwrap().take() {
            let _ = handle.join();
            info!("sampler reclaim loop stopped");
        }
        self.buffer.clean();
        self.decisions.write().unwrap().clear();
    }
}
