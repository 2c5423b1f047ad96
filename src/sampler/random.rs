//! Deterministic probabilistic sampling by trace ID.

use super::error::{SampleError, SampleResult};
use super::evaluator::Evaluator;
use crate::record::{Record, RecordType, Span, StatusCode};

/// Number of buckets the hash space is divided into.
const NUM_HASH_BUCKETS: u32 = 0x4000;

/// Fleet-wide hash seed.
///
/// Every collector instance must use the same seed, algorithm, and bucket
/// math so they agree on the sampling decision for a given trace.
const SAMPLING_HASH_SEED: u32 = 22222;

/// Span attribute overriding the hash decision: 0 forces drop, any value
/// greater than 0 forces keep.
const SAMPLING_PRIORITY_KEY: &str = "sampling.priority";

/// 32-bit FNV-1a over the seed bytes followed by the trace ID bytes.
fn sampling_hash(seed: u32, bytes: &[u8; 16]) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for b in seed.to_be_bytes().iter().chain(bytes.iter()) {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Evaluator keeping a deterministic percentage of traces.
///
/// Error-status spans are always kept regardless of the hash, and an
/// explicit sampling-priority attribute overrides it in either direction.
#[derive(Debug)]
pub struct RandomEvaluator {
    scaled_rate: u32,
}

impl RandomEvaluator {
    /// Create an evaluator keeping roughly `percentage` of traces (0–100).
    pub fn new(percentage: f64) -> Self {
        let percentage = percentage.clamp(0.0, 100.0);
        Self {
            scaled_rate: (percentage * f64::from(NUM_HASH_BUCKETS) / 100.0) as u32,
        }
    }

    fn keep(&self, span: &Span) -> bool {
        if span.status.code == StatusCode::Error {
            return true;
        }

        if let Some(priority) = span
            .attributes
            .get(SAMPLING_PRIORITY_KEY)
            .and_then(|v| v.as_f64())
        {
            return priority > 0.0;
        }

        let hash = sampling_hash(SAMPLING_HASH_SEED, &span.trace_id.to_bytes());
        hash & (NUM_HASH_BUCKETS - 1) < self.scaled_rate
    }
}

impl Evaluator for RandomEvaluator {
    fn evaluate(&self, record: &mut Record) -> SampleResult<()> {
        if record.record_type != RecordType::Traces {
            return Ok(());
        }

        record.data.retain_spans(|span| self.keep(span));
        if record.data.is_empty() {
            return Err(SampleError::Skip);
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "random"
    }
}
