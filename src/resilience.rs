//! Deferred retry of best-effort operations under degraded connectivity.
//!
//! A [`ResilienceQueue`] runs operations in one of three modes:
//!
//! - [`ExecutionMode::Immediate`]: run now, return the outcome
//! - [`ExecutionMode::Queued`]: park for the next drain
//! - [`ExecutionMode::ImmediateWithRetry`]: run now and park on failure;
//!   the inline attempt counts against the retry budget, and with a budget
//!   of one the failure is returned instead
//!
//! [`ResilienceQueue::submit`] picks the mode from the current
//! [`DegradationState`]: priority 1 always runs immediately, everything else
//! is queued while degraded and run-with-retry otherwise.
//!
//! Drains process queued items in ascending priority number (1 first) and
//! FIFO within a priority, in batches that shrink while degraded. An item
//! that exhausts its retry budget is dropped: it is logged at `error!` and
//! kept in a bounded dead-letter list, but no caller is notified. Only
//! submit work here that can tolerate that.
//!
//! The degraded state is set by an external signal
//! ([`ResilienceQueue::signal_degraded`]) or detected automatically after
//! `failure_threshold` consecutive failures; a success clears the detected
//! state. Retry budgets are multiplied while degraded.

use crate::config::ResilienceConfig;
use crate::error::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Priority that always bypasses the queue.
pub const CRITICAL_PRIORITY: u8 = 1;

type Operation = Box<dyn FnMut() -> BoxFuture<'static, Result<()>> + Send>;

/// Degraded-connectivity signal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DegradationState {
    pub active: bool,
    /// Severity reported by the signal source; `0` when not degraded.
    pub stage: u8,
}

/// How [`ResilienceQueue::execute`] treats an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Immediate,
    Queued,
    ImmediateWithRetry,
}

/// What happened to a submitted operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Submission {
    /// Ran and succeeded.
    Completed,
    /// Parked for a later drain.
    Queued,
    /// Ran, failed, and was parked for retry.
    Deferred { error: String },
}

/// A permanently failed operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeadLetter {
    pub name: String,
    pub priority: u8,
    pub attempts: u32,
    pub last_error: String,
}

/// Result of one drain pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub dropped: usize,
}

struct QueuedOperation {
    seq: u64,
    name: String,
    priority: u8,
    retries: u32,
    max_retries: u32,
    op: Operation,
}

#[derive(Default)]
struct QueueState {
    items: Vec<QueuedOperation>,
    signal: DegradationState,
    detected: bool,
    consecutive_failures: u32,
    dead_letters: VecDeque<DeadLetter>,
    next_seq: u64,
}

impl QueueState {
    fn is_degraded(&self) -> bool {
        self.signal.active || self.detected
    }
}

struct QueueInner {
    config: ResilienceConfig,
    state: Mutex<QueueState>,
}

/// Priority queue of deferred operations. Cheap to clone.
#[derive(Clone)]
pub struct ResilienceQueue {
    inner: Arc<QueueInner>,
}

impl ResilienceQueue {
    pub fn new(config: ResilienceConfig) -> Self {
        ResilienceQueue {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.inner.config
    }

    /// Current degradation state, including automatic detection.
    pub fn state(&self) -> DegradationState {
        let state = self.inner.state.lock();
        if state.signal.active {
            state.signal
        } else if state.detected {
            DegradationState {
                active: true,
                stage: 1,
            }
        } else {
            DegradationState::default()
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.state.lock().is_degraded()
    }

    /// External signal: connectivity is degraded at `stage`.
    pub fn signal_degraded(&self, stage: u8) {
        warn!("⚠ Degraded state signalled (stage {})", stage);
        self.inner.state.lock().signal = DegradationState {
            active: true,
            stage,
        };
    }

    /// External signal: connectivity is back to normal.
    pub fn signal_recovered(&self) {
        info!("Degraded state cleared");
        let mut state = self.inner.state.lock();
        state.signal = DegradationState::default();
        state.detected = false;
        state.consecutive_failures = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Permanently failed operations, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.state.lock().dead_letters.iter().cloned().collect()
    }

    /// Run `op` with the mode chosen by priority and degradation state.
    ///
    /// # Errors
    ///
    /// Priority-1 operations report their failure, as do others when the
    /// retry budget leaves no room for a queued retry; see [`Self::execute`].
    pub async fn submit<F, Fut>(&self, name: &str, priority: u8, op: F) -> Result<Submission>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mode = if priority <= CRITICAL_PRIORITY {
            ExecutionMode::Immediate
        } else if self.is_degraded() {
            ExecutionMode::Queued
        } else {
            ExecutionMode::ImmediateWithRetry
        };
        self.execute(name, priority, mode, op).await
    }

    /// Run `op` in the given mode. Priority 1 is always immediate.
    ///
    /// # Errors
    ///
    /// Returns the operation's error in `Immediate` mode, and in
    /// `ImmediateWithRetry` mode when the retry budget is a single attempt.
    pub async fn execute<F, Fut>(
        &self,
        name: &str,
        priority: u8,
        mode: ExecutionMode,
        op: F,
    ) -> Result<Submission>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mode = if priority <= CRITICAL_PRIORITY {
            ExecutionMode::Immediate
        } else {
            mode
        };
        let mut op = boxed(op);

        match mode {
            ExecutionMode::Queued => {
                self.enqueue_boxed(name, priority, op);
                Ok(Submission::Queued)
            }
            ExecutionMode::Immediate => {
                let result = op().await;
                self.record_outcome(result.is_ok());
                result.map(|()| Submission::Completed)
            }
            ExecutionMode::ImmediateWithRetry => match op().await {
                Ok(()) => {
                    self.record_outcome(true);
                    Ok(Submission::Completed)
                }
                Err(e) => {
                    self.record_outcome(false);
                    let budget = self
                        .retry_budget(self.inner.config.default_max_retries, self.is_degraded());
                    if budget <= 1 {
                        return Err(e);
                    }
                    warn!("Operation {} failed, queued for retry: {}", name, e);
                    self.push(name, priority, 1, op);
                    Ok(Submission::Deferred {
                        error: e.to_string(),
                    })
                }
            },
        }
    }

    /// Park an operation for the next drain.
    pub fn enqueue<F, Fut>(&self, name: &str, priority: u8, op: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.enqueue_boxed(name, priority, boxed(op));
    }

    fn enqueue_boxed(&self, name: &str, priority: u8, op: Operation) {
        self.push(name, priority, 0, op);
    }

    fn push(&self, name: &str, priority: u8, attempts: u32, op: Operation) {
        let mut state = self.inner.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.items.push(QueuedOperation {
            seq,
            name: name.to_string(),
            priority,
            retries: attempts,
            max_retries: self.inner.config.default_max_retries,
            op,
        });
        debug!(
            "Queued {} (priority {}, {} pending)",
            name,
            priority,
            state.items.len()
        );
    }

    /// Process one batch of queued operations.
    pub async fn drain(&self) -> DrainReport {
        let (batch, degraded) = {
            let mut state = self.inner.state.lock();
            let degraded = state.is_degraded();
            let batch_size = if degraded {
                self.inner.config.degraded_batch_size
            } else {
                self.inner.config.batch_size
            };
            state.items.sort_by_key(|item| (item.priority, item.seq));
            let take = batch_size.min(state.items.len());
            let batch: Vec<QueuedOperation> = state.items.drain(..take).collect();
            (batch, degraded)
        };

        let mut report = DrainReport::default();
        if batch.is_empty() {
            return report;
        }
        debug!("Draining {} queued operation(s)", batch.len());

        for mut item in batch {
            report.processed += 1;
            match (item.op)().await {
                Ok(()) => {
                    self.record_outcome(true);
                    report.succeeded += 1;
                    debug!("✓ Queued operation {} succeeded", item.name);
                }
                Err(e) => {
                    self.record_outcome(false);
                    item.retries += 1;
                    let budget = self.retry_budget(item.max_retries, degraded);
                    if item.retries >= budget {
                        report.dropped += 1;
                        self.dead_letter(item, e.to_string());
                    } else {
                        report.requeued += 1;
                        debug!(
                            "Queued operation {} failed (retry {}/{}): {}",
                            item.name, item.retries, budget, e
                        );
                        self.inner.state.lock().items.push(item);
                    }
                }
            }
        }

        if report.dropped > 0 || report.requeued > 0 {
            info!(
                "Drain finished: {} succeeded, {} requeued, {} dropped",
                report.succeeded, report.requeued, report.dropped
            );
        }
        report
    }

    /// Drain on a fixed period until the handle is dropped.
    ///
    /// Returns `None` outside a tokio runtime.
    pub fn spawn_drainer(&self) -> Option<DrainerHandle> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let queue = self.clone();
        let period = self.inner.config.drain_interval().max(Duration::from_millis(1));

        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                queue.drain().await;
            }
        });
        Some(DrainerHandle { task })
    }

    fn retry_budget(&self, max_retries: u32, degraded: bool) -> u32 {
        if degraded {
            (max_retries as f64 * self.inner.config.degraded_retry_multiplier).ceil() as u32
        } else {
            max_retries
        }
    }

    fn dead_letter(&self, item: QueuedOperation, last_error: String) {
        error!(
            "✗ Operation {} (priority {}) permanently failed after {} attempts: {}",
            item.name, item.priority, item.retries, last_error
        );
        let mut state = self.inner.state.lock();
        if self.inner.config.dead_letter_capacity == 0 {
            return;
        }
        if state.dead_letters.len() >= self.inner.config.dead_letter_capacity {
            state.dead_letters.pop_front();
        }
        state.dead_letters.push_back(DeadLetter {
            name: item.name,
            priority: item.priority,
            attempts: item.retries,
            last_error,
        });
    }

    fn record_outcome(&self, success: bool) {
        let mut state = self.inner.state.lock();
        if success {
            state.consecutive_failures = 0;
            if state.detected {
                info!("Operations succeeding again, leaving degraded state");
                state.detected = false;
            }
        } else {
            state.consecutive_failures += 1;
            if !state.detected && state.consecutive_failures >= self.inner.config.failure_threshold {
                warn!(
                    "⚠ {} consecutive failures, entering degraded state",
                    state.consecutive_failures
                );
                state.detected = true;
            }
        }
    }
}

fn boxed<F, Fut>(mut op: F) -> Operation
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move || -> BoxFuture<'static, Result<()>> { Box::pin(op()) })
}

/// Stops the background drainer when dropped.
pub struct DrainerHandle {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for DrainerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
