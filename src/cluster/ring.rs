//! Consistent-hash ring routing traces to cluster members.

use super::error::{ClusterError, ClusterResult};
use crate::record::TraceBatch;
use std::collections::{BTreeMap, HashMap};

/// Number of partitions the key space is divided into.
const DEFAULT_PARTITION_COUNT: usize = 271;

/// Virtual nodes placed on the ring per member.
const DEFAULT_REPLICATION_FACTOR: usize = 20;

/// Bound on how far above the average a member's partition load may grow.
const DEFAULT_LOAD_FACTOR: f64 = 1.25;

/// 64-bit FNV-1a.
fn fnv64(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A consistent-hash ring with virtual nodes and bounded member load.
///
/// Each member is placed on the ring as `replication_factor` virtual
/// nodes; the key space is split into a fixed number of partitions, each
/// owned by the nearest virtual node whose member is below the load bound.
/// For a fixed membership set, routing is a deterministic function of the
/// key; membership changes move only the minimal fraction of partitions.
#[derive(Debug)]
pub struct HashRing {
    partition_count: usize,
    replication_factor: usize,
    load_factor: f64,
    ring: BTreeMap<u64, String>,
    members: Vec<String>,
    partitions: Vec<Option<String>>,
}

impl HashRing {
    /// Create an empty ring with default tuning.
    pub fn new() -> Self {
        Self {
            partition_count: DEFAULT_PARTITION_COUNT,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            load_factor: DEFAULT_LOAD_FACTOR,
            ring: BTreeMap::new(),
            members: Vec::new(),
            partitions: vec![None; DEFAULT_PARTITION_COUNT],
        }
    }

    /// Current members, sorted.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Whether the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether the member is registered.
    pub fn contains(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }

    /// Register a member and reassign partitions.
    pub fn add_member(&mut self, member: &str) {
        if self.contains(member) {
            return;
        }

        for replica in 0..self.replication_factor {
            let point = fnv64(format!("{member}#{replica}").as_bytes());
            self.ring.insert(point, member.to_string());
        }
        self.members.push(member.to_string());
        self.members.sort();
        self.rebuild_partitions();
    }

    /// Deregister a member and reassign its partitions.
    pub fn remove_member(&mut self, member: &str) {
        if !self.contains(member) {
            return;
        }

        for replica in 0..self.replication_factor {
            let point = fnv64(format!("{member}#{replica}").as_bytes());
            self.ring.remove(&point);
        }
        self.members.retain(|m| m != member);
        self.rebuild_partitions();
    }

    /// Maximum partitions one member may own.
    fn average_load(&self) -> usize {
        if self.members.is_empty() {
            return 0;
        }
        let avg = self.partition_count as f64 / self.members.len() as f64 * self.load_factor;
        avg.ceil() as usize
    }

    fn rebuild_partitions(&mut self) {
        self.partitions = vec![None; self.partition_count];
        if self.members.is_empty() {
            return;
        }

        let bound = self.average_load();
        let mut loads: HashMap<&str, usize> = HashMap::new();

        for partition in 0..self.partition_count {
            let point = fnv64(&(partition as u64).to_be_bytes());

            // Walk the ring clockwise from the partition's point until a
            // member below the load bound is found. The bound is sized so
            // the walk always terminates.
            let owner = self
                .ring
                .range(point..)
                .chain(self.ring.range(..point))
                .map(|(_, member)| member.as_str())
                .find(|member| loads.get(member).copied().unwrap_or(0) < bound);

            if let Some(owner) = owner {
                *loads.entry(owner).or_insert(0) += 1;
                self.partitions[partition] = Some(owner.to_string());
            }
        }
    }

    /// The member owning the given routing key.
    pub fn locate(&self, key: &str) -> ClusterResult<String> {
        if self.is_empty() {
            return Err(ClusterError::EmptyRing);
        }

        let partition = (fnv64(key.as_bytes()) % self.partition_count as u64) as usize;
        self.partitions[partition]
            .clone()
            .ok_or(ClusterError::EmptyRing)
    }

    /// Pick the member responsible for a trace batch.
    ///
    /// The routing key is the hex trace ID of the first span found in the
    /// batch.
    pub fn pick_traces(&self, batch: &TraceBatch) -> ClusterResult<String> {
        if self.is_empty() {
            return Err(ClusterError::EmptyRing);
        }

        let trace_id = batch.first_trace_id().ok_or(ClusterError::NoRoutingKey)?;
        self.locate(&trace_id.to_hex())
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{
        ResourceSpans, ScopeSpans, Span, SpanId, SpanKind, SpanStatus, StatusCode, TraceId,
    };
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;

    fn make_batch(trace: u64) -> TraceBatch {
        TraceBatch {
            resource_spans: vec![ResourceSpans {
                resource: StdHashMap::new(),
                scope_spans: vec![ScopeSpans {
                    scope: "test".to_string(),
                    spans: vec![Span {
                        trace_id: TraceId::new(0, trace),
                        span_id: SpanId::new(1),
                        parent_span_id: SpanId::invalid(),
                        name: "op".to_string(),
                        kind: SpanKind::Internal,
                        start_time: Utc::now(),
                        end_time: Utc::now(),
                        status: SpanStatus::from_code(StatusCode::Ok),
                        attributes: StdHashMap::new(),
                    }],
                }],
            }],
        }
    }

    fn two_member_ring() -> HashRing {
        let mut ring = HashRing::new();
        ring.add_member("10.0.0.1:4316");
        ring.add_member("10.0.0.2:4316");
        ring
    }

    #[test]
    fn test_empty_ring_errors() {
        let ring = HashRing::new();
        assert!(matches!(ring.locate("key"), Err(ClusterError::EmptyRing)));
        assert!(matches!(
            ring.pick_traces(&make_batch(1)),
            Err(ClusterError::EmptyRing)
        ));
    }

    #[test]
    fn test_no_routing_key_errors() {
        let ring = two_member_ring();
        assert!(matches!(
            ring.pick_traces(&TraceBatch::new()),
            Err(ClusterError::NoRoutingKey)
        ));
    }

    #[test]
    fn test_locate_is_deterministic() {
        let ring = two_member_ring();
        let first = ring.locate("some-trace").unwrap();
        for _ in 0..10 {
            assert_eq!(ring.locate("some-trace").unwrap(), first);
        }
    }

    #[test]
    fn test_pick_traces_is_deterministic() {
        let ring = two_member_ring();
        let batch = make_batch(42);
        let first = ring.pick_traces(&batch).unwrap();
        for _ in 0..10 {
            assert_eq!(ring.pick_traces(&batch).unwrap(), first);
        }
    }

    #[test]
    fn test_removed_member_never_returned() {
        let mut ring = two_member_ring();
        let batch = make_batch(42);
        let picked = ring.pick_traces(&batch).unwrap();

        ring.remove_member(&picked);
        let repicked = ring.pick_traces(&batch).unwrap();
        assert_ne!(repicked, picked);
        assert!(ring.contains(&repicked));
    }

    #[test]
    fn test_all_members_receive_load() {
        let mut ring = HashRing::new();
        for i in 1..=4 {
            ring.add_member(&format!("10.0.0.{i}:4316"));
        }

        let mut counts: StdHashMap<String, usize> = StdHashMap::new();
        for key in 0..1000u64 {
            let member = ring.locate(&format!("trace-{key}")).unwrap();
            *counts.entry(member).or_insert(0) += 1;
        }

        assert_eq!(counts.len(), 4);
        let bound = (1000.0 / 4.0 * 2.0) as usize;
        for (member, count) in &counts {
            assert!(*count > 0 && *count < bound, "{member}: {count}");
        }
    }

    #[test]
    fn test_minimal_disruption_on_member_change() {
        let mut ring = HashRing::new();
        for i in 1..=4 {
            ring.add_member(&format!("10.0.0.{i}:4316"));
        }

        let keys: Vec<String> = (0..500u64).map(|k| format!("trace-{k}")).collect();
        let before: Vec<String> = keys.iter().map(|k| ring.locate(k).unwrap()).collect();

        ring.add_member("10.0.0.5:4316");
        let after: Vec<String> = keys.iter().map(|k| ring.locate(k).unwrap()).collect();

        let moved = before
            .iter()
            .zip(after.iter())
            .filter(|(b, a)| b != a)
            .count();
        // A fifth member should take roughly a fifth of the keys; far less
        // than a full reshuffle.
        assert!(moved < 250, "moved {moved} of 500 keys");
    }

    #[test]
    fn test_add_member_is_idempotent() {
        let mut ring = two_member_ring();
        ring.add_member("10.0.0.1:4316");
        assert_eq!(ring.members().len(), 2);
    }
}
