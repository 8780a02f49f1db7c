//! Audit Sink Background Task
//!
//! Every intercepted exchange is persisted as an audit record without
//! holding up the response. Requests hand an [`AuditEntry`] to the
//! [`AuditSink`], which queues it on a bounded channel; a single background
//! task drains the queue and runs up to `max_in_flight` writes at once.
//!
//! Submission never blocks. When the queue is full the entry is dropped and
//! counted, so a slow store degrades auditing rather than latency. Write
//! failures are logged and counted, never surfaced to a caller.
//!
//! On shutdown the task stops accepting new entries, writes everything
//! already queued and waits for in-flight writes, bounded by
//! `shutdown_timeout`.

use crate::constants::{
    DEFAULT_AUDIT_MAX_IN_FLIGHT, DEFAULT_AUDIT_QUEUE_CAPACITY, DEFAULT_AUDIT_SHUTDOWN_SECS,
};
use crate::telemetry::{metrics, AuditOutcome};
use keypoint_core::{AuditRecord, Fingerprint, NewAuditRecord, StorageError};
use keypoint_storage::{ResultStore, SharedResultStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the audit sink.
#[derive(Debug, Clone)]
pub struct AuditSinkConfig {
    /// Entries that may wait for a writer before new ones are dropped
    /// (default: 1024)
    pub queue_capacity: usize,

    /// Concurrent store writes (default: 8)
    pub max_in_flight: usize,

    /// How long shutdown waits for the queue to drain (default: 10 seconds)
    pub shutdown_timeout: Duration,
}

impl Default for AuditSinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_AUDIT_QUEUE_CAPACITY,
            max_in_flight: DEFAULT_AUDIT_MAX_IN_FLIGHT,
            shutdown_timeout: Duration::from_secs(DEFAULT_AUDIT_SHUTDOWN_SECS),
        }
    }
}

impl AuditSinkConfig {
    /// Create AuditSinkConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `KEYPOINT_AUDIT_QUEUE_CAPACITY`: Queue capacity (default: 1024)
    /// - `KEYPOINT_AUDIT_MAX_IN_FLIGHT`: Concurrent writes (default: 8)
    /// - `KEYPOINT_AUDIT_SHUTDOWN_SECS`: Drain budget at shutdown (default: 10)
    pub fn from_env() -> Self {
        let queue_capacity = std::env::var("KEYPOINT_AUDIT_QUEUE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_AUDIT_QUEUE_CAPACITY);

        let max_in_flight = std::env::var("KEYPOINT_AUDIT_MAX_IN_FLIGHT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_AUDIT_MAX_IN_FLIGHT);

        let shutdown_timeout = Duration::from_secs(
            std::env::var("KEYPOINT_AUDIT_SHUTDOWN_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_AUDIT_SHUTDOWN_SECS),
        );

        Self {
            queue_capacity,
            max_in_flight,
            shutdown_timeout,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for audit sink activity since startup.
#[derive(Debug, Default)]
pub struct AuditSinkMetrics {
    /// Entries accepted onto the queue
    pub submitted: AtomicU64,

    /// Records persisted
    pub written: AtomicU64,

    /// Writes the store rejected
    pub failed: AtomicU64,

    /// Entries rejected because the queue was full or closed
    pub dropped: AtomicU64,
}

impl AuditSinkMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> AuditSinkSnapshot {
        AuditSinkSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: AuditOutcome) {
        let counter = match outcome {
            AuditOutcome::Written => &self.written,
            AuditOutcome::Failed => &self.failed,
            AuditOutcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = metrics() {
            metrics.record_audit(outcome);
        }
    }
}

/// Snapshot of audit sink metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSinkSnapshot {
    pub submitted: u64,
    pub written: u64,
    pub failed: u64,
    pub dropped: u64,
}

// ============================================================================
// ENTRIES
// ============================================================================

/// One captured exchange waiting to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    /// Route the exchange was served on
    pub operation: String,
    /// Captured response text or a placeholder
    pub response_text: String,
    pub fingerprint: Option<Fingerprint>,
}

impl AuditEntry {
    pub fn new(
        operation: impl Into<String>,
        response_text: impl Into<String>,
        fingerprint: Option<Fingerprint>,
    ) -> Self {
        Self {
            operation: operation.into(),
            response_text: response_text.into(),
            fingerprint,
        }
    }

    /// Parse the response text into the stored payload form.
    pub fn into_record(self) -> NewAuditRecord {
        NewAuditRecord::from_response_text(self.operation, &self.response_text, self.fingerprint)
    }
}

/// Persist one entry. JSON response text is stored parsed; anything else
/// is stored as a raw string.
pub async fn write_entry(
    store: &dyn ResultStore,
    entry: AuditEntry,
) -> Result<AuditRecord, StorageError> {
    store.append(entry.into_record()).await
}

// ============================================================================
// SINK HANDLE
// ============================================================================

/// Cheap, cloneable handle used by requests to submit audit entries.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEntry>,
    metrics: Arc<AuditSinkMetrics>,
}

impl AuditSink {
    /// Start the background writer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(store: SharedResultStore, config: AuditSinkConfig) -> (Self, AuditWorker) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(AuditSinkMetrics::new());

        let handle = tokio::spawn(audit_sink_task(
            store,
            rx,
            config.max_in_flight.max(1),
            Arc::clone(&metrics),
            shutdown_rx,
        ));

        let sink = Self {
            tx,
            metrics: Arc::clone(&metrics),
        };
        let worker = AuditWorker {
            handle,
            shutdown_tx,
            metrics,
            shutdown_timeout: config.shutdown_timeout,
        };
        (sink, worker)
    }

    /// Queue an entry for persistence. Returns immediately; `false` means
    /// the entry was dropped.
    pub fn submit(&self, entry: AuditEntry) -> bool {
        match self.tx.try_send(entry) {
            Ok(()) => {
                self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(entry)) => {
                self.metrics.record(AuditOutcome::Dropped);
                tracing::warn!(operation = %entry.operation, "Audit queue full, dropping record");
                false
            }
            Err(TrySendError::Closed(entry)) => {
                self.metrics.record(AuditOutcome::Dropped);
                tracing::warn!(operation = %entry.operation, "Audit sink stopped, dropping record");
                false
            }
        }
    }

    pub fn metrics(&self) -> AuditSinkSnapshot {
        self.metrics.snapshot()
    }
}

/// Owner of the background writer; used once, at shutdown.
pub struct AuditWorker {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    metrics: Arc<AuditSinkMetrics>,
    shutdown_timeout: Duration,
}

impl AuditWorker {
    /// Stop accepting entries, flush the queue and wait for in-flight
    /// writes, up to the configured timeout.
    pub async fn shutdown(self) -> AuditSinkSnapshot {
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(self.shutdown_timeout, self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Audit sink task failed"),
            Err(_) => tracing::warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Audit sink did not drain before timeout, queued records are lost"
            ),
        }

        self.metrics.snapshot()
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

async fn audit_sink_task(
    store: SharedResultStore,
    mut rx: mpsc::Receiver<AuditEntry>,
    max_in_flight: usize,
    metrics: Arc<AuditSinkMetrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();

    tracing::info!(max_in_flight, "Audit sink started");

    loop {
        while in_flight.try_join_next().is_some() {}
        if in_flight.len() >= max_in_flight {
            in_flight.join_next().await;
            continue;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Audit sink shutting down");
                    break;
                }
            }

            entry = rx.recv() => match entry {
                Some(entry) => spawn_write(&mut in_flight, &store, entry, &metrics),
                None => break,
            }
        }
    }

    // Flush whatever was queued before the channel closed.
    rx.close();
    let mut flushed = 0u64;
    while let Some(entry) = rx.recv().await {
        while in_flight.len() >= max_in_flight {
            in_flight.join_next().await;
        }
        spawn_write(&mut in_flight, &store, entry, &metrics);
        flushed += 1;
    }
    while in_flight.join_next().await.is_some() {}

    let snapshot = metrics.snapshot();
    tracing::info!(
        flushed,
        submitted = snapshot.submitted,
        written = snapshot.written,
        failed = snapshot.failed,
        dropped = snapshot.dropped,
        "Audit sink stopped"
    );
}

fn spawn_write(
    in_flight: &mut JoinSet<()>,
    store: &SharedResultStore,
    entry: AuditEntry,
    metrics: &Arc<AuditSinkMetrics>,
) {
    let store = Arc::clone(store);
    let metrics = Arc::clone(metrics);

    in_flight.spawn(async move {
        let operation = entry.operation.clone();
        match write_entry(store.as_ref(), entry).await {
            Ok(record) => {
                metrics.record(AuditOutcome::Written);
                tracing::debug!(
                    record_id = record.id,
                    operation = %operation,
                    cached = record.fingerprint.is_some(),
                    "Audit record written"
                );
            }
            Err(e) => {
                metrics.record(AuditOutcome::Failed);
                tracing::warn!(error = %e, operation = %operation, "Failed to write audit record");
            }
        }
    });
}
