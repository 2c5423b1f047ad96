//! Membership resolvers.

use super::config::{ResolverConfig, ResolverType};
use super::error::ClusterResult;
use super::notifier::{EndpointEvent, EndpointNotifier};
use tokio::sync::mpsc;
use tracing::info;

/// A source of membership events.
pub trait Resolver: Send + Sync {
    /// Take the membership event stream.
    fn watch(&self) -> ClusterResult<mpsc::Receiver<EndpointEvent>>;

    /// The resolver variant name.
    fn kind(&self) -> &'static str;

    /// Stop emitting events and close the stream.
    fn stop(&self);
}

/// Resolver over a fixed endpoint list, synchronized once at construction.
#[derive(Debug)]
pub struct StaticResolver {
    notifier: EndpointNotifier,
}

impl StaticResolver {
    /// Create a resolver that immediately announces the given endpoints.
    pub fn new(endpoints: &[String]) -> Self {
        let notifier = EndpointNotifier::new();
        notifier.sync(endpoints);
        info!(count = endpoints.len(), "static membership synchronized");
        Self { notifier }
    }
}

impl Resolver for StaticResolver {
    fn watch(&self) -> ClusterResult<mpsc::Receiver<EndpointEvent>> {
        self.notifier.watch()
    }

    fn kind(&self) -> &'static str {
        "static"
    }

    fn stop(&self) {
        self.notifier.stop();
    }
}

/// Resolver that never emits membership; used when clustering is disabled.
#[derive(Debug, Default)]
pub struct NoopResolver {
    notifier: EndpointNotifier,
}

impl NoopResolver {
    /// Create a resolver with no membership source.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Resolver for NoopResolver {
    fn watch(&self) -> ClusterResult<mpsc::Receiver<EndpointEvent>> {
        self.notifier.watch()
    }

    fn kind(&self) -> &'static str {
        "noop"
    }

    fn stop(&self) {
        self.notifier.stop();
    }
}

/// Create a resolver from configuration.
pub fn new_resolver(config: &ResolverConfig) -> Box<dyn Resolver> {
    match config.resolver_type {
        ResolverType::Static => Box::new(StaticResolver::new(&config.endpoints)),
        ResolverType::Noop => Box::new(NoopResolver::new()),
    }
}
