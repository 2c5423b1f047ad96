//! Cluster forwarding configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Membership source variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverType {
    /// No membership; clustering is disabled.
    #[default]
    Noop,
    /// Fixed endpoint list synchronized once at construction.
    Static,
}

/// Membership resolver configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Resolver variant.
    #[serde(rename = "type")]
    pub resolver_type: ResolverType,

    /// This node's own endpoint string.
    pub identifier: String,

    /// Peer endpoint strings.
    pub endpoints: Vec<String>,
}

/// Configuration for the cluster forwarding layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Membership resolver.
    pub resolver: ResolverConfig,

    /// How often not-ready endpoints are re-dialed.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Upper bound on a single dial attempt.
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            resolver: ResolverConfig::default(),
            retry_interval: default_retry_interval(),
            dial_timeout: default_dial_timeout(),
        }
    }
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(3)
}
