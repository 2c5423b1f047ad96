//! Inbound side of the cluster forward call.

use super::error::ClusterResult;
use super::wire::{read_frame, write_frame, ForwardRequest, ForwardResponse};
use crate::record::{RecordType, TraceBatch};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handler invoked for every forwarded batch, whether it arrived over the
/// wire or through the in-process local path.
pub trait ForwardHandler: Send + Sync + 'static {
    /// Process one forwarded batch.
    fn handle(&self, record_type: RecordType, batch: TraceBatch) -> ClusterResult<()>;
}

/// Accept loop decoding forward frames and dispatching to the handler.
pub struct ForwardService {
    listen: String,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

impl ForwardService {
    /// Create a service bound to the given address once started.
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            local_addr: None,
            shutdown_tx: None,
            accept_task: None,
        }
    }

    /// The bound address, available after `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(&mut self, handler: Arc<dyn ForwardHandler>) -> ClusterResult<()> {
        let listener = TcpListener::bind(&self.listen).await?;
        self.local_addr = Some(listener.local_addr()?);
        info!(addr = %self.local_addr.unwrap(), "forward service listening");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, peer)) => {
                                debug!(peer = %peer, "forward connection accepted");
                                let handler = Arc::clone(&handler);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, handler).await {
                                        error!(error = %e, "forward connection error");
                                    }
                                });
                            },
                            Err(e) => {
                                error!(error = %e, "accept error");
                            },
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("forward service shutting down");
                        break;
                    }
                }
            }
        });
        self.accept_task = Some(task);

        Ok(())
    }

    /// Signal the accept loop to stop and wait for it to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }
}

/// Serve forward calls on one client connection until it closes.
async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<dyn ForwardHandler>,
) -> std::io::Result<()> {
    loop {
        let body = match read_frame(&mut stream).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("forward client disconnected");
                break;
            },
            Err(e) => return Err(e),
        };

        let response = match dispatch(&body, handler.as_ref()) {
            Ok(()) => ForwardResponse::ok(),
            Err(message) => {
                warn!(error = %message, "forward call rejected");
                ForwardResponse::error(message)
            },
        };

        let response_bytes = match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to serialize forward response");
                continue;
            },
        };
        write_frame(&mut stream, &response_bytes).await?;
    }

    Ok(())
}

/// Decode one forward request and hand the batch to the handler.
fn dispatch(body: &[u8], handler: &dyn ForwardHandler) -> Result<(), String> {
    let request = ForwardRequest::from_bytes(body).map_err(|e| e.to_string())?;

    let record_type = RecordType::parse(&request.record_type);
    if record_type == RecordType::Undefined {
        return Err(format!("unsupported record type '{}'", request.record_type));
    }

    let batch: TraceBatch =
        rmp_serde::from_slice(&request.body).map_err(|e| format!("invalid batch body: {e}"))?;

    handler.handle(record_type, batch).map_err(|e| e.to_string())
}
