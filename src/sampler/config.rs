//! Sampler configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which evaluator to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorType {
    /// Keep everything.
    #[default]
    Always,
    /// Drop everything (when enabled).
    Drop,
    /// Deterministic probabilistic sampling by trace ID.
    Random,
    /// Tail sampling keyed on span status codes.
    StatusCode,
}

/// Storage policy for spans dropped before a trace's decision is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePolicy {
    /// Buffer complete span payloads so they can be replayed once the
    /// trace is marked keep.
    #[default]
    Full,
    /// No buffering; spans dropped before the decision are gone.
    Post,
}

/// Configuration for the sampler stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Evaluator variant to run.
    #[serde(rename = "type")]
    pub evaluator: EvaluatorType,

    /// Whether the drop evaluator actually drops.
    pub enabled: bool,

    /// Percentage of traces kept by the random evaluator (0–100).
    pub sampling_percentage: f64,

    /// Span status labels that mark a trace as must-keep.
    pub status_codes: Vec<String>,

    /// Storage policy for undecided spans.
    pub storage_policy: StoragePolicy,

    /// Upper bound on buffered spans per trace and stream.
    pub max_spans_per_trace: usize,

    /// Inactivity duration after which trace decisions are reclaimed.
    #[serde(with = "humantime_serde")]
    pub max_duration: Duration,

    /// How often the reclaim loop wakes.
    #[serde(with = "humantime_serde")]
    pub reclaim_interval: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            evaluator: EvaluatorType::Always,
            enabled: true,
            sampling_percentage: default_sampling_percentage(),
            status_codes: Vec::new(),
            storage_policy: StoragePolicy::default(),
            max_spans_per_trace: default_max_spans_per_trace(),
            max_duration: default_max_duration(),
            reclaim_interval: default_reclaim_interval(),
        }
    }
}

fn default_sampling_percentage() -> f64 {
    100.0
}

fn default_max_spans_per_trace() -> usize {
    100
}

fn default_max_duration() -> Duration {
    Duration::from_secs(600)
}

fn default_reclaim_interval() -> Duration {
    Duration::from_secs(60)
}
