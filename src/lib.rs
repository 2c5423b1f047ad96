//! # span-relay
//!
//! A tail-sampling and cluster-forwarding stage for a distributed trace
//! collector.
//!
//! ## Features
//!
//! - Tail sampling: keep or discard whole traces based on span statuses
//!   observed after earlier spans have already arrived, with bounded
//!   buffering and replay
//! - Deterministic probabilistic sampling that agrees across collector
//!   instances
//! - Consistent-hash routing of surviving spans to the owning node of a
//!   multi-node collector cluster, with dynamic membership and connection
//!   retry
//!
//! ## Architecture
//!
//! ```text
//! incoming batches
//!       │
//!       ▼
//! ┌────────────┐   keep / buffer / replay   ┌───────────────┐
//! │  Evaluator │───────────────────────────▶│ ClusterClient │
//! │ (sampler)  │                            │  (forwarder)  │
//! └────────────┘                            └───────┬───────┘
//!                                         ring pick │
//!                              ┌────────────────────┼─────────────┐
//!                              ▼                    ▼             ▼
//!                        local handler         peer :4317    peer :4318
//! ```
//!
//! The decoding of wire formats into [`record::TraceBatch`] and the
//! batching exporter that consumes decided spans live outside this crate;
//! records enter through [`sampler::Evaluator::evaluate`] and leave
//! through [`cluster::ClusterClient::forward_traces`] or the in-process
//! [`cluster::ForwardHandler`].

pub mod cluster;
pub mod config;
pub mod record;
pub mod sampler;
