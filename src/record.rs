//! Pipeline record types and the trace batch data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Errors raised while constructing or parsing record identifiers.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Trace ID could not be parsed.
    #[error("invalid trace id: {0}")]
    InvalidTraceId(String),

    /// Span ID could not be parsed.
    #[error("invalid span id: {0}")]
    InvalidSpanId(String),
}

/// Result type for record operations.
pub type RecordResult<T> = Result<T, RecordError>;

/// The kind of payload a record carries through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    /// Trace spans.
    Traces,
    /// Metric samples.
    Metrics,
    /// Log entries.
    Logs,
    /// Spans derived from another record inside the pipeline.
    TracesDerived,
    /// Metrics derived from another record inside the pipeline.
    MetricsDerived,
    /// Logs derived from another record inside the pipeline.
    LogsDerived,
    /// Unrecognized record type.
    Undefined,
}

impl RecordType {
    /// The wire label for this record type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Traces => "traces",
            Self::Metrics => "metrics",
            Self::Logs => "logs",
            Self::TracesDerived => "traces.derived",
            Self::MetricsDerived => "metrics.derived",
            Self::LogsDerived => "logs.derived",
            Self::Undefined => "undefined",
        }
    }

    /// Parse a wire label into a record type.
    pub fn parse(s: &str) -> Self {
        match s {
            "traces" => Self::Traces,
            "metrics" => Self::Metrics,
            "logs" => Self::Logs,
            "traces.derived" => Self::TracesDerived,
            "metrics.derived" => Self::MetricsDerived,
            "logs.derived" => Self::LogsDerived,
            _ => Self::Undefined,
        }
    }

    /// Whether this is a derived record type.
    pub fn is_derived(&self) -> bool {
        matches!(
            self,
            Self::TracesDerived | Self::MetricsDerived | Self::LogsDerived
        )
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Routing token attached to every record.
///
/// `data_id` identifies the data stream a record belongs to; sampler state
/// is segregated per stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Raw token string as received at the edge.
    pub original: String,

    /// Numeric data-stream identifier.
    pub data_id: i64,
}

impl Token {
    /// Create a new token.
    pub fn new(original: impl Into<String>, data_id: i64) -> Self {
        Self {
            original: original.into(),
            data_id,
        }
    }
}

/// 128-bit trace identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId {
    high: u64,
    low: u64,
}

impl TraceId {
    /// Create a new trace ID from high and low parts.
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// Create an invalid (zero) trace ID.
    pub fn invalid() -> Self {
        Self { high: 0, low: 0 }
    }

    /// Check if this trace ID is valid (non-zero).
    pub fn is_valid(&self) -> bool {
        self.high != 0 || self.low != 0
    }

    /// Convert to bytes (big-endian).
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.high.to_be_bytes());
        bytes[8..].copy_from_slice(&self.low.to_be_bytes());
        bytes
    }

    /// Create from bytes (big-endian).
    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        let high = u64::from_be_bytes(bytes[..8].try_into().unwrap());
        let low = u64::from_be_bytes(bytes[8..].try_into().unwrap());
        Self { high, low }
    }

    /// Parse from hex string (32 characters).
    pub fn from_hex(hex: &str) -> RecordResult<Self> {
        if hex.len() != 32 {
            return Err(RecordError::InvalidTraceId(format!(
                "expected 32 hex chars, got {}",
                hex.len()
            )));
        }

        let high = u64::from_str_radix(&hex[..16], 16)
            .map_err(|e| RecordError::InvalidTraceId(format!("invalid hex: {e}")))?;
        let low = u64::from_str_radix(&hex[16..], 16)
            .map_err(|e| RecordError::InvalidTraceId(format!("invalid hex: {e}")))?;

        Ok(Self { high, low })
    }

    /// Convert to hex string (32 characters).
    pub fn to_hex(&self) -> String {
        format!("{:016x}{:016x}", self.high, self.low)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.to_hex())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// 64-bit span identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpanId(u64);

impl SpanId {
    /// Create a new span ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Create an invalid (zero) span ID.
    pub fn invalid() -> Self {
        Self(0)
    }

    /// Check if this span ID is valid (non-zero).
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Get the raw value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Convert to bytes (big-endian).
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Create from bytes (big-endian).
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Self(u64::from_be_bytes(*bytes))
    }

    /// Parse from hex string (16 characters).
    pub fn from_hex(hex: &str) -> RecordResult<Self> {
        if hex.len() != 16 {
            return Err(RecordError::InvalidSpanId(format!(
                "expected 16 hex chars, got {}",
                hex.len()
            )));
        }

        let id = u64::from_str_radix(hex, 16)
            .map_err(|e| RecordError::InvalidSpanId(format!("invalid hex: {e}")))?;

        Ok(Self(id))
    }

    /// Convert to hex string (16 characters).
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self.to_hex())
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Span kind (role in the trace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanKind {
    /// Internal operation (default).
    #[default]
    Internal,
    /// Server side of a synchronous call.
    Server,
    /// Client side of a synchronous call.
    Client,
    /// Producer of an async message.
    Producer,
    /// Consumer of an async message.
    Consumer,
}

/// Span status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    /// Unset (default).
    #[default]
    Unset,
    /// Operation completed successfully.
    Ok,
    /// Operation failed with an error.
    Error,
}

impl StatusCode {
    /// The label used in sampler configuration to name this code.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unset => "UNSET",
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }
}

/// Span status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanStatus {
    /// Status code.
    pub code: StatusCode,

    /// Optional error message.
    pub message: Option<String>,
}

impl SpanStatus {
    /// A status with the given code and no message.
    pub fn from_code(code: StatusCode) -> Self {
        Self {
            code,
            message: None,
        }
    }
}

/// Attribute value attached to spans and resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// String value.
    String(String),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Boolean value.
    Bool(bool),
}

impl AttributeValue {
    /// Interpret the value as a number, if possible.
    ///
    /// Numeric strings are parsed; booleans are not numbers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::String(s) => s.trim().parse::<f64>().ok(),
            Self::Bool(_) => None,
        }
    }
}

/// One timed operation within a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Owning trace.
    pub trace_id: TraceId,

    /// Unique identifier within the trace.
    pub span_id: SpanId,

    /// Parent span, zero for root spans.
    pub parent_span_id: SpanId,

    /// Operation name.
    pub name: String,

    /// Role of the span in the trace.
    pub kind: SpanKind,

    /// Start timestamp.
    pub start_time: DateTime<Utc>,

    /// End timestamp.
    pub end_time: DateTime<Utc>,

    /// Status outcome.
    pub status: SpanStatus,

    /// Arbitrary span attributes.
    pub attributes: HashMap<String, AttributeValue>,
}

impl Span {
    /// Whether both identifiers are extractable.
    pub fn has_valid_ids(&self) -> bool {
        self.trace_id.is_valid() && self.span_id.is_valid()
    }
}

/// Spans emitted by one instrumentation scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeSpans {
    /// Instrumentation scope name.
    pub scope: String,

    /// Spans belonging to the scope.
    pub spans: Vec<Span>,
}

/// Spans emitted by one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpans {
    /// Resource attributes.
    pub resource: HashMap<String, AttributeValue>,

    /// Scope groups under the resource.
    pub scope_spans: Vec<ScopeSpans>,
}

/// A batch of trace spans grouped Resource → Scope → Span.
///
/// A single batch may mix spans from many distinct traces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceBatch {
    /// Resource groups in this batch.
    pub resource_spans: Vec<ResourceSpans>,
}

impl TraceBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of spans in the batch.
    pub fn span_count(&self) -> usize {
        self.resource_spans
            .iter()
            .flat_map(|rs| rs.scope_spans.iter())
            .map(|ss| ss.spans.len())
            .sum()
    }

    /// Whether the batch contains no spans.
    pub fn is_empty(&self) -> bool {
        self.span_count() == 0
    }

    /// Iterate over every span in the batch.
    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.resource_spans
            .iter()
            .flat_map(|rs| rs.scope_spans.iter())
            .flat_map(|ss| ss.spans.iter())
    }

    /// The trace ID of the first span found, used as the routing key.
    pub fn first_trace_id(&self) -> Option<TraceId> {
        self.spans()
            .find(|s| s.trace_id.is_valid())
            .map(|s| s.trace_id)
    }

    /// The set of distinct trace IDs present in the batch.
    pub fn trace_ids(&self) -> HashSet<TraceId> {
        self.spans()
            .filter(|s| s.trace_id.is_valid())
            .map(|s| s.trace_id)
            .collect()
    }

    /// Remove every span failing the predicate, pruning emptied groups.
    pub fn retain_spans<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Span) -> bool,
    {
        for rs in &mut self.resource_spans {
            for ss in &mut rs.scope_spans {
                ss.spans.retain(|span| keep(span));
            }
            rs.scope_spans.retain(|ss| !ss.spans.is_empty());
        }
        self.resource_spans.retain(|rs| !rs.scope_spans.is_empty());
    }

    /// Append another batch's resource groups to this one.
    pub fn merge(&mut self, other: TraceBatch) {
        self.resource_spans.extend(other.resource_spans);
    }

    /// Produce one standalone single-span batch per span, each keeping its
    /// resource and scope context.
    pub fn single_span_snapshots(&self) -> Vec<TraceBatch> {
        let mut out = Vec::with_capacity(self.span_count());
        for rs in &self.resource_spans {
            for ss in &rs.scope_spans {
                for span in &ss.spans {
                    out.push(TraceBatch {
                        resource_spans: vec![ResourceSpans {
                            resource: rs.resource.clone(),
                            scope_spans: vec![ScopeSpans {
                                scope: ss.scope.clone(),
                                spans: vec![span.clone()],
                            }],
                        }],
                    });
                }
            }
        }
        out
    }

    /// Split the batch into independent per-trace sub-batches, preserving
    /// resource and scope grouping, in first-seen trace order.
    pub fn split_by_trace(&self) -> Vec<(TraceId, TraceBatch)> {
        let mut order: Vec<TraceId> = Vec::new();
        let mut by_trace: HashMap<TraceId, TraceBatch> = HashMap::new();

        for rs in &self.resource_spans {
            for ss in &rs.scope_spans {
                for span in &ss.spans {
                    let entry = by_trace.entry(span.trace_id).or_insert_with(|| {
                        order.push(span.trace_id);
                        TraceBatch::new()
                    });

                    // Reuse the tail group when it matches this span's
                    // resource and scope; otherwise open a new one.
                    let needs_group = match entry.resource_spans.last() {
                        Some(last) => {
                            last.resource != rs.resource
                                || last.scope_spans.last().map(|s| s.scope.as_str())
                                    != Some(ss.scope.as_str())
                        },
                        None => true,
                    };
                    if needs_group {
                        entry.resource_spans.push(ResourceSpans {
                            resource: rs.resource.clone(),
                            scope_spans: vec![ScopeSpans {
                                scope: ss.scope.clone(),
                                spans: Vec::new(),
                            }],
                        });
                    }
                    let rs_tail = entry.resource_spans.last_mut().unwrap();
                    rs_tail
                        .scope_spans
                        .last_mut()
                        .unwrap()
                        .spans
                        .push(span.clone());
                }
            }
        }

        order
            .into_iter()
            .map(|tid| {
                let batch = by_trace.remove(&tid).unwrap_or_default();
                (tid, batch)
            })
            .collect()
    }
}

/// The unit flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Payload kind.
    pub record_type: RecordType,

    /// Routing token.
    pub token: Token,

    /// Trace payload.
    pub data: TraceBatch,
}

impl Record {
    /// Create a traces record.
    pub fn traces(token: Token, data: TraceBatch) -> Self {
        Self {
            record_type: RecordType::Traces,
            token,
            data,
        }
    }

    /// Collapse a derived record type back to its base type.
    pub fn unwrap_derived(&mut self) {
        self.record_type = match self.record_type {
            RecordType::TracesDerived => RecordType::Traces,
            RecordType::MetricsDerived => RecordType::Metrics,
            RecordType::LogsDerived => RecordType::Logs,
            other => other,
        };
    }
}
