//! span-relay binary entry point.

use span_relay::cluster::{ClusterClient, ClusterResult, ForwardHandler, ForwardService};
use span_relay::config::Config;
use span_relay::record::{RecordType, TraceBatch};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Inbound handler logging forwarded batches.
///
/// A real deployment replaces this with the pipeline's ingestion queue;
/// the binary only wires the stage together.
struct LoggingHandler;

impl ForwardHandler for LoggingHandler {
    fn handle(&self, record_type: RecordType, batch: TraceBatch) -> ClusterResult<()> {
        info!(
            record_type = %record_type,
            spans = batch.span_count(),
            "received forwarded batch"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => match Config::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path, error = %e, "failed to load configuration");
                std::process::exit(1);
            },
        },
        None => Config::default(),
    };

    info!("span-relay v{}", env!("CARGO_PKG_VERSION"));

    let handler: Arc<dyn ForwardHandler> = Arc::new(LoggingHandler);

    let mut service = ForwardService::new(config.cluster.resolver.identifier.clone());
    if !config.cluster.resolver.identifier.is_empty() {
        if let Err(e) = service.start(Arc::clone(&handler)).await {
            error!(error = %e, "failed to start forward service");
            std::process::exit(1);
        }
    }

    let mut client = match ClusterClient::new(&config.cluster, handler).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to start cluster client");
            std::process::exit(1);
        },
    };

    let evaluator = span_relay::sampler::new_evaluator(&config.sampler);
    info!(evaluator = evaluator.kind(), "sampler ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for shutdown signal");
    }

    info!("shutting down");
    evaluator.stop();
    if let Err(e) = client.stop().await {
        error!(error = %e, "error while closing cluster connections");
    }
    service.stop().await;
}
