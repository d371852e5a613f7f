//! Change notification fan-out.
//!
//! Every ingestion produces one `IndexerEvent` holding an ordered change
//! list. The dispatcher gives each listener its own unbounded channel and
//! worker task, so listeners see events in ingestion order, a slow listener
//! never delays another, and a failing listener never fails `on_product`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::DispatchConfig;
use crate::models::{Event, ProductSummary};

/// What happened to an event or product during one ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    EventAdded,
    EventUpdated,
    EventDeleted,
    EventArchived,
    EventMerged,
    EventSplit,
    ProductAdded,
    ProductUpdated,
    ProductDeleted,
    ProductArchived,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::EventAdded => "EVENT_ADDED",
            ChangeKind::EventUpdated => "EVENT_UPDATED",
            ChangeKind::EventDeleted => "EVENT_DELETED",
            ChangeKind::EventArchived => "EVENT_ARCHIVED",
            ChangeKind::EventMerged => "EVENT_MERGED",
            ChangeKind::EventSplit => "EVENT_SPLIT",
            ChangeKind::ProductAdded => "PRODUCT_ADDED",
            ChangeKind::ProductUpdated => "PRODUCT_UPDATED",
            ChangeKind::ProductDeleted => "PRODUCT_DELETED",
            ChangeKind::ProductArchived => "PRODUCT_ARCHIVED",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change, with the event as it was before and after.
///
/// `original` is None for EVENT_ADDED and the product kinds; `current` is
/// None for EVENT_DELETED, EVENT_ARCHIVED, and the product kinds.
#[derive(Debug, Clone)]
pub struct IndexerChange {
    pub kind: ChangeKind,
    pub original: Option<Event>,
    pub current: Option<Event>,
}

impl IndexerChange {
    pub fn new(kind: ChangeKind, original: Option<Event>, current: Option<Event>) -> Self {
        Self {
            kind,
            original,
            current,
        }
    }
}

/// The outcome of one ingestion or sweep: the triggering summary (None for
/// archive sweeps) and its ordered changes.
#[derive(Debug, Clone, Default)]
pub struct IndexerEvent {
    pub summary: Option<ProductSummary>,
    pub changes: Vec<IndexerChange>,
}

impl IndexerEvent {
    pub fn push(&mut self, change: IndexerChange) {
        self.changes.push(change);
    }

    pub fn kinds(&self) -> Vec<ChangeKind> {
        self.changes.iter().map(|c| c.kind).collect()
    }
}

/// Receives indexer events after each committed mutation.
#[async_trait]
pub trait IndexerListener: Send + Sync {
    /// Name used in logs and worker identification.
    fn name(&self) -> &str;

    /// Handle one event. Errors drive retry accounting only.
    async fn on_indexer_event(&self, event: &IndexerEvent) -> Result<()>;

    /// Delivery attempts per event. None uses the configured default.
    fn max_tries(&self) -> Option<u32> {
        None
    }

    /// Per-attempt timeout. None uses the configured default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

struct Worker {
    name: String,
    sender: mpsc::UnboundedSender<Arc<IndexerEvent>>,
    handle: JoinHandle<()>,
}

/// Fans committed events out to listeners.
pub struct Dispatcher {
    workers: Vec<Worker>,
}

impl Dispatcher {
    pub fn new(listeners: Vec<Arc<dyn IndexerListener>>, config: &DispatchConfig) -> Self {
        let workers = listeners
            .into_iter()
            .map(|listener| {
                let (sender, receiver) = mpsc::unbounded_channel();
                let name = listener.name().to_string();
                let max_tries = listener.max_tries().unwrap_or(config.default_max_tries).max(1);
                let timeout = listener
                    .timeout()
                    .unwrap_or(Duration::from_secs(config.default_timeout_secs));
                let handle =
                    tokio::spawn(run_worker(listener, receiver, max_tries, timeout));
                Worker {
                    name,
                    sender,
                    handle,
                }
            })
            .collect();
        Self { workers }
    }

    /// Queue an event for every listener. Never blocks.
    pub fn dispatch(&self, event: IndexerEvent) {
        let event = Arc::new(event);
        for worker in &self.workers {
            if worker.sender.send(event.clone()).is_err() {
                warn!(listener = %worker.name, "listener worker is gone, dropping event");
            }
        }
    }

    /// Close all channels and wait for queued events to drain.
    pub async fn shutdown(self) {
        for worker in self.workers {
            drop(worker.sender);
            if let Err(e) = worker.handle.await {
                warn!(listener = %worker.name, "listener worker panicked: {}", e);
            }
        }
    }
}

async fn run_worker(
    listener: Arc<dyn IndexerListener>,
    mut receiver: mpsc::UnboundedReceiver<Arc<IndexerEvent>>,
    max_tries: u32,
    timeout: Duration,
) {
    while let Some(event) = receiver.recv().await {
        for attempt in 1..=max_tries {
            match tokio::time::timeout(timeout, listener.on_indexer_event(&event)).await {
                Ok(Ok(())) => {
                    debug!(
                        listener = listener.name(),
                        changes = event.changes.len(),
                        "delivered indexer event"
                    );
                    break;
                }
                Ok(Err(e)) => {
                    warn!(
                        listener = listener.name(),
                        attempt, max_tries, "listener failed: {:#}", e
                    );
                }
                Err(_) => {
                    warn!(
                        listener = listener.name(),
                        attempt,
                        max_tries,
                        "listener timed out after {:?}",
                        timeout
                    );
                }
            }
        }
    }
}
