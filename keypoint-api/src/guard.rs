//! Lazy, once-only detector initialization.
//!
//! [`DetectorGuard`] owns the shared detector. The first caller of
//! [`DetectorGuard::get`] starts an initialization attempt (construct then
//! warmup); callers that arrive while it runs wait on the same attempt and
//! receive the same outcome. Once an attempt succeeds, every later call
//! returns the ready detector without taking a lock.
//!
//! A failed attempt is not remembered: its waiters all receive the error,
//! and the next caller starts a fresh attempt.
//!
//! The attempt runs on its own task, so a caller that gives up (client
//! disconnect, timeout) does not abort warmup for everyone else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Instant;

use keypoint_core::{DetectorError, DetectorFactory, SharedDetector};
use tokio::sync::watch;

use crate::telemetry::metrics;

type AttemptOutcome = Option<Result<SharedDetector, DetectorError>>;

struct GuardInner {
    factory: Arc<dyn DetectorFactory>,
    ready: OnceLock<SharedDetector>,
    /// Receiver for the attempt currently running, if any.
    attempt: Mutex<Option<watch::Receiver<AttemptOutcome>>>,
    attempts: AtomicU64,
}

impl GuardInner {
    fn attempt_slot(&self) -> MutexGuard<'_, Option<watch::Receiver<AttemptOutcome>>> {
        // The slot holds no invariant a panic could break halfway.
        self.attempt.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum Joined {
    Ready(SharedDetector),
    Waiting(watch::Receiver<AttemptOutcome>),
}

/// Shared handle to the process-wide detector.
#[derive(Clone)]
pub struct DetectorGuard {
    inner: Arc<GuardInner>,
}

impl DetectorGuard {
    pub fn new(factory: Arc<dyn DetectorFactory>) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                factory,
                ready: OnceLock::new(),
                attempt: Mutex::new(None),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Whether a detector has been successfully initialized. Never blocks
    /// and never starts initialization.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.get().is_some()
    }

    /// Number of initialization attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Return the ready detector, initializing it first if needed.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn get(&self) -> Result<SharedDetector, DetectorError> {
        if let Some(detector) = self.inner.ready.get() {
            return Ok(Arc::clone(detector));
        }

        let mut rx = match self.join_or_start() {
            Joined::Ready(detector) => return Ok(detector),
            Joined::Waiting(rx) => rx,
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };

        match outcome {
            Some(result) => result,
            None => {
                // The attempt's task ended without publishing (it panicked).
                self.forget_attempt(&rx);
                Err(DetectorError::initialization(
                    "detector initialization aborted",
                ))
            }
        }
    }

    /// Start initialization in the background without waiting for it.
    pub fn prewarm(&self) {
        let _ = self.join_or_start();
    }

    fn join_or_start(&self) -> Joined {
        let mut slot = self.inner.attempt_slot();

        // Re-check under the lock: an attempt may have finished since the
        // caller's fast-path check.
        if let Some(detector) = self.inner.ready.get() {
            return Joined::Ready(Arc::clone(detector));
        }
        if let Some(rx) = slot.as_ref() {
            return Joined::Waiting(rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());
        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::spawn(run_attempt(Arc::clone(&self.inner), tx, attempt));

        Joined::Waiting(rx)
    }

    fn forget_attempt(&self, rx: &watch::Receiver<AttemptOutcome>) {
        let mut slot = self.inner.attempt_slot();
        if slot.as_ref().is_some_and(|current| current.same_channel(rx)) {
            *slot = None;
        }
    }
}

async fn run_attempt(inner: Arc<GuardInner>, tx: watch::Sender<AttemptOutcome>, attempt: u64) {
    let started = Instant::now();
    tracing::info!(attempt, "Detector initialization started");

    let result = initialize(inner.factory.as_ref()).await;

    {
        let mut slot = inner.attempt_slot();
        if let Ok(detector) = &result {
            let _ = inner.ready.set(Arc::clone(detector));
        }
        *slot = None;
    }

    match &result {
        Ok(_) => tracing::info!(
            attempt,
            duration_ms = started.elapsed().as_millis(),
            "Detector ready"
        ),
        Err(e) => tracing::error!(
            attempt,
            error = %e,
            duration_ms = started.elapsed().as_millis(),
            "Detector initialization failed, next request will retry"
        ),
    }
    if let Some(metrics) = metrics() {
        metrics.record_detector_warmup(result.is_ok());
    }

    tx.send_replace(Some(result));
}

async fn initialize(factory: &dyn DetectorFactory) -> Result<SharedDetector, DetectorError> {
    let detector = factory.construct().await.map_err(as_initialization)?;
    detector.warmup().await.map_err(as_initialization)?;
    Ok(detector)
}

fn as_initialization(err: DetectorError) -> DetectorError {
    match err {
        DetectorError::Processing { reason } => DetectorError::Initialization { reason },
        init => init,
    }
}
