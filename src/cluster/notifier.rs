//! Membership change notification.

use super::error::{ClusterError, ClusterResult};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Capacity of the event stream between notifier and consumer.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// A change to the locally-known membership set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// Endpoint newly present.
    Add(String),
    /// Endpoint newly absent.
    Delete(String),
}

impl EndpointEvent {
    /// The endpoint the event refers to.
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Add(ep) | Self::Delete(ep) => ep,
        }
    }
}

/// Computes membership deltas between successive endpoint snapshots and
/// publishes them as an event stream.
///
/// Events are published with a non-blocking bounded send so a slow
/// consumer can never deadlock shutdown; overflow is logged and dropped.
#[derive(Debug)]
pub struct EndpointNotifier {
    known: Mutex<HashSet<String>>,
    tx: Mutex<Option<mpsc::Sender<EndpointEvent>>>,
    rx: Mutex<Option<mpsc::Receiver<EndpointEvent>>>,
    stopped: AtomicBool,
}

impl EndpointNotifier {
    /// Create a notifier with an empty known set.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            known: Mutex::new(HashSet::new()),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Diff the new endpoint set against the last-known set and emit one
    /// event per changed member, additions first, each group sorted.
    ///
    /// Calling twice with an unchanged set emits nothing. Ignored once the
    /// notifier is stopped.
    pub fn sync(&self, endpoints: &[String]) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let current: HashSet<String> = endpoints.iter().cloned().collect();
        let (added, removed) = {
            let mut known = self.known.lock().unwrap();

            let mut added: Vec<String> = current.difference(&known).cloned().collect();
            let mut removed: Vec<String> = known.difference(&current).cloned().collect();
            added.sort();
            removed.sort();

            *known = current;
            (added, removed)
        };

        for endpoint in added {
            debug!(endpoint = %endpoint, "endpoint added");
            self.publish(EndpointEvent::Add(endpoint));
        }
        for endpoint in removed {
            debug!(endpoint = %endpoint, "endpoint removed");
            self.publish(EndpointEvent::Delete(endpoint));
        }
    }

    fn publish(&self, event: EndpointEvent) {
        let tx = self.tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            if let Err(e) = tx.try_send(event) {
                warn!(error = %e, "membership event dropped");
            }
        }
    }

    /// Take the receiving half of the event stream.
    ///
    /// The stream can be taken exactly once.
    pub fn watch(&self) -> ClusterResult<mpsc::Receiver<EndpointEvent>> {
        self.rx
            .lock()
            .unwrap()
            .take()
            .ok_or(ClusterError::WatchTaken)
    }

    /// Mark the notifier terminal and close the event stream.
    ///
    /// Buffered events remain readable; the stream ends once drained.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.tx.lock().unwrap().take();
    }
}

impl Default for EndpointNotifier {
    fn default() -> Self {
        Self::new()
    }
}
