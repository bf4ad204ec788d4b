use crate::errors::MetaError;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

/// A replayable unit of background work. The factory builds a fresh
/// future per attempt, so the work must be idempotent: the runner gives
/// at-least-once execution, never exactly-once.
pub struct DeferredTask {
    name: &'static str,
    factory: Box<dyn Fn() -> BoxFuture<'static, Result<(), MetaError>> + Send + Sync>,
}

impl DeferredTask {
    pub fn new<F, Fut>(name: &'static str, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MetaError>> + Send + 'static,
    {
        Self {
            name,
            factory: Box::new(move || Box::pin(factory())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn run(&self) -> BoxFuture<'static, Result<(), MetaError>> {
        (self.factory)()
    }
}

pub trait DeferredTaskRunner: Send + Sync + 'static {
    fn schedule(&self, task: DeferredTask);
}

/// Tokio-backed runner: each task gets a per-attempt deadline and a
/// bounded retry budget with backoff. An attempt hitting its deadline is
/// re-run from scratch, the same as a re-enqueued deferred task; the loop
/// is checkpoint-free and driven entirely by datastore state.
pub struct TokioTaskRunner {
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    shutdown: CancellationToken,
    max_attempts: u32,
    attempt_timeout: Duration,
    retry_backoff: Duration,
}

impl TokioTaskRunner {
    pub fn new(shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            shutdown,
            max_attempts: 16,
            attempt_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(10),
        })
    }

    /// Wait until every scheduled task (including tasks scheduled by
    /// running tasks) has finished. Tasks chain-schedule before they
    /// complete, so the count never dips to zero with work still pending.
    pub async fn quiesce(&self) {
        loop {
            let drained = self.drained.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl DeferredTaskRunner for TokioTaskRunner {
    fn schedule(&self, task: DeferredTask) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let in_flight = self.in_flight.clone();
        let drained = self.drained.clone();
        let shutdown = self.shutdown.clone();
        let max_attempts = self.max_attempts;
        let attempt_timeout = self.attempt_timeout;
        let retry_backoff = self.retry_backoff;
        let name = task.name();

        let fut = async move {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let result = tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(task = name, "shutdown, abandoning deferred task");
                        break;
                    }
                    result = tokio::time::timeout(attempt_timeout, task.run()) => result,
                };
                match result {
                    Ok(Ok(())) => break,
                    Ok(Err(MetaError::Exhausted)) => {
                        // Normal end of a background pass.
                        break;
                    }
                    Ok(Err(e)) if e.is_retryable() && attempt < max_attempts => {
                        debug!(task = name, attempt, error = %e, "deferred task retrying");
                        tokio::time::sleep(retry_backoff * attempt).await;
                    }
                    Ok(Err(e)) => {
                        error!(task = name, attempt, error = %e, "abandoning deferred task");
                        break;
                    }
                    Err(_) if attempt < max_attempts => {
                        debug!(task = name, attempt, "deferred task deadline, re-running");
                    }
                    Err(_) => {
                        error!(task = name, attempt, "deferred task deadline budget spent");
                        break;
                    }
                }
            }
            in_flight.fetch_sub(1, Ordering::AcqRel);
            drained.notify_waiters();
        };
        tokio::spawn(fut.instrument(tracing::debug_span!("deferred", task = name)));
    }
}
