//! # Cluster Module
//!
//! Consistent-hash forwarding of trace batches across a multi-node
//! collector cluster.
//!
//! Membership flows from a [`resolver::Resolver`] through an
//! [`notifier::EndpointNotifier`] event stream into the
//! [`client::ClusterClient`], which keeps one connection per member and
//! routes each trace to its owner on the [`ring::HashRing`]. The member
//! matching the locally-configured identifier is dispatched in-process;
//! every other member is reached over the framed wire protocol served by
//! [`service::ForwardService`].

pub mod client;
pub mod config;
pub mod error;
pub mod notifier;
pub mod resolver;
pub mod ring;
pub mod service;
pub mod wire;

pub use client::{ClientStats, ClusterClient};
pub use config::{ClusterConfig, ResolverConfig, ResolverType};
pub use error::{ClusterError, ClusterResult};
pub use notifier::{EndpointEvent, EndpointNotifier};
pub use resolver::{new_resolver, NoopResolver, Resolver, StaticResolver};
pub use ring::HashRing;
pub use service::{ForwardHandler, ForwardService};
pub use wire::{ForwardRequest, ForwardResponse};
