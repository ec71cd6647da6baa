use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use tokio::sync::broadcast;

use crate::config::ConfigProvider;
use crate::error::{Result, TaggerError};
use crate::events::BatchEvent;
use crate::queue::PriorityQueue;
use crate::types::*;
use crate::ItemAnalyzer;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Mutable state of the batch in flight. Only ever touched under one lock.
#[derive(Debug)]
struct BatchRun {
    batch_id: String,
    status: BatchStatus,
    total: usize,
    processed_count: usize,
    failed_count: usize,
    processed_ids: Vec<String>,
    failed_ids: Vec<String>,
    results: Vec<ItemOutcome>,
    cancelled: bool,
    /// A worker fault stopped the batch early.
    faulted: bool,
}

impl Default for BatchRun {
    fn default() -> Self {
        Self {
            batch_id: String::new(),
            status: BatchStatus::Idle,
            total: 0,
            processed_count: 0,
            failed_count: 0,
            processed_ids: Vec::new(),
            failed_ids: Vec::new(),
            results: Vec::new(),
            cancelled: false,
            faulted: false,
        }
    }
}

impl BatchRun {
    fn owns(&self, batch_id: &str) -> bool {
        self.batch_id == batch_id
    }

    fn final_status(&self) -> BatchStatus {
        if self.faulted {
            BatchStatus::Failed
        } else if self.cancelled {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        }
    }
}

/// State shared between the orchestrator and its workers.
struct Shared {
    run: Mutex<BatchRun>,
    queue: PriorityQueue<WorkItem>,
    events: broadcast::Sender<BatchEvent>,
}

impl Shared {
    fn lock_run(&self) -> MutexGuard<'_, BatchRun> {
        // Every mutation is a single assignment block; a poisoned guard is still consistent.
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: BatchEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Take the next item for `batch_id`, or `None` once it is drained,
    /// cancelled or no longer the current batch.
    ///
    /// The ownership check and the dequeue share the run lock, so a worker
    /// from a finished batch can never take an item queued for the next one.
    fn next_item(&self, batch_id: &str) -> Option<WorkItem> {
        let run = self.lock_run();
        if !run.owns(batch_id) || run.status != BatchStatus::Running {
            return None;
        }
        self.queue.dequeue()
    }

    fn record_success(&self, batch_id: &str, item_id: String, analysis: AnalysisResult) {
        let event = {
            let mut run = self.lock_run();
            if !run.owns(batch_id) {
                return;
            }
            self.queue.complete();
            run.processed_count += 1;
            run.processed_ids.push(item_id.clone());
            let tags = analysis.tags.clone();
            run.results.push(ItemOutcome::success(item_id.clone(), analysis));
            BatchEvent::ItemCompleted {
                batch_id: batch_id.to_string(),
                item_id,
                tags,
                processed: run.processed_count,
                failed: run.failed_count,
                total: run.total,
            }
        };
        self.emit(event);
    }

    fn record_failure(&self, batch_id: &str, item_id: String, error: String) {
        let event = {
            let mut run = self.lock_run();
            if !run.owns(batch_id) {
                return;
            }
            self.queue.complete();
            run.failed_count += 1;
            run.failed_ids.push(item_id.clone());
            run.results.push(ItemOutcome::failure(item_id.clone(), error.clone()));
            BatchEvent::ItemFailed {
                batch_id: batch_id.to_string(),
                item_id,
                error,
                processed: run.processed_count,
                failed: run.failed_count,
                total: run.total,
            }
        };
        self.emit(event);
    }

    fn mark_faulted(&self, batch_id: &str) {
        let mut run = self.lock_run();
        if run.owns(batch_id) {
            run.faulted = true;
        }
    }

    /// Move a running batch to `Cancelling` and drop its unstarted items.
    fn request_cancel(&self, batch_id: &str) -> bool {
        {
            let mut run = self.lock_run();
            if !run.owns(batch_id) || run.status != BatchStatus::Running {
                return false;
            }
            run.status = BatchStatus::Cancelling;
            run.cancelled = true;
        }

        let cleared = self.queue.clear(false);
        tracing::info!(batch_id = %batch_id, cleared, "Batch cancellation requested");
        self.emit(BatchEvent::CancelRequested {
            batch_id: batch_id.to_string(),
            cleared,
        });
        true
    }
}

/// Returns the orchestrator to `Idle` however `execute()` exits.
struct IdleGuard<'a> {
    shared: &'a Shared,
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        // Release ownership first so stale workers stop dequeuing.
        *self.shared.lock_run() = BatchRun::default();
        self.shared.queue.clear(true);
    }
}

/// Runs batches of items through an [`ItemAnalyzer`] on a fixed-size worker pool.
///
/// Only one batch runs at a time; a second [`execute()`](Self::execute) while
/// one is active fails with [`TaggerError::AlreadyRunning`]. Cancellation is
/// cooperative: workers check for it before taking each item, and items
/// already being analyzed finish and are counted.
///
/// # Example
///
/// ```ignore
/// let orchestrator = BatchOrchestrator::new(analyzer, Arc::new(TaggerConfig::default()));
/// let outcome = orchestrator
///     .execute(ids, ProviderSettings::new("ollama"), BatchOptions::default())
///     .await?;
/// println!("{} tagged, {} failed", outcome.success_count, outcome.failure_count);
/// ```
pub struct BatchOrchestrator<A: ItemAnalyzer> {
    analyzer: Arc<A>,
    config: Arc<dyn ConfigProvider>,
    shared: Arc<Shared>,
}

impl<A: ItemAnalyzer> BatchOrchestrator<A> {
    pub fn new(analyzer: A, config: Arc<dyn ConfigProvider>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            analyzer: Arc::new(analyzer),
            config,
            shared: Arc::new(Shared {
                run: Mutex::new(BatchRun::default()),
                queue: PriorityQueue::new(),
                events,
            }),
        }
    }

    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }

    /// Receive [`BatchEvent`]s for every batch run after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.shared.events.subscribe()
    }

    /// Liveness statistics of the work queue.
    pub fn queue_stats(&self) -> QueueSnapshot {
        self.shared.queue.stats()
    }

    /// Worker count for a batch: the explicit request, else the configured
    /// limit for the model, else for the provider, else the default. Never 0.
    pub fn resolve_concurrency(
        &self,
        settings: &ProviderSettings,
        requested: Option<usize>,
    ) -> Result<usize> {
        let resolved = match requested {
            Some(n) => n,
            None => self
                .config
                .concurrency_limits()?
                .resolve(&settings.provider_id, settings.model_id.as_deref())
                .unwrap_or_else(|| self.config.default_concurrency()),
        };
        Ok(resolved.max(1))
    }

    /// Analyze every item and return the aggregated outcome.
    ///
    /// Per-item failures are recorded in the outcome, not returned as errors.
    /// Only setup problems (another batch running, configuration failure)
    /// fail the call.
    pub async fn execute(
        &self,
        item_ids: Vec<String>,
        settings: ProviderSettings,
        options: BatchOptions,
    ) -> Result<BatchOutcome> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let total = item_ids.len();
        {
            let mut run = self.shared.lock_run();
            if run.status.is_active() {
                return Err(TaggerError::AlreadyRunning);
            }
            *run = BatchRun {
                batch_id: batch_id.clone(),
                status: BatchStatus::Running,
                total,
                ..Default::default()
            };
        }
        let _idle = IdleGuard {
            shared: &self.shared,
        };

        let concurrency = self
            .resolve_concurrency(&settings, options.concurrency)
            .map_err(|e| match e {
                TaggerError::Config(_) => e,
                other => TaggerError::Config(format!("Failed to resolve concurrency: {}", other)),
            })?;

        let settings = Arc::new(settings);
        for item_id in item_ids {
            self.shared.queue.enqueue(
                WorkItem {
                    item_id,
                    priority: options.priority,
                    settings: Arc::clone(&settings),
                },
                options.priority,
            );
        }

        tracing::info!(batch_id = %batch_id, total, concurrency, "Starting batch");
        self.shared.emit(BatchEvent::Started {
            batch_id: batch_id.clone(),
            total,
            concurrency,
        });

        let workers: Vec<_> = (0..concurrency)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    batch_id.clone(),
                    Arc::clone(&self.shared),
                    Arc::clone(&self.analyzer),
                    options.clone(),
                ))
            })
            .collect();

        for handle in workers {
            if let Err(e) = handle.await {
                tracing::error!(batch_id = %batch_id, error = %e, "Worker task aborted");
                self.shared.mark_faulted(&batch_id);
                if !options.continue_on_error {
                    self.shared.request_cancel(&batch_id);
                }
            }
        }

        let outcome = {
            let mut run = self.shared.lock_run();
            run.status = run.final_status();
            BatchOutcome {
                batch_id: batch_id.clone(),
                status: run.status,
                total: run.total,
                success_count: run.processed_count,
                failure_count: run.failed_count,
                processed_ids: std::mem::take(&mut run.processed_ids),
                failed_ids: std::mem::take(&mut run.failed_ids),
                results: std::mem::take(&mut run.results),
                cancelled: run.cancelled,
            }
        };

        tracing::info!(
            batch_id = %batch_id,
            status = outcome.status.as_str(),
            succeeded = outcome.success_count,
            failed = outcome.failure_count,
            unprocessed = outcome.unprocessed(),
            "Batch finished"
        );
        self.shared.emit(BatchEvent::Finished {
            batch_id,
            status: outcome.status,
            success_count: outcome.success_count,
            failure_count: outcome.failure_count,
            total: outcome.total,
        });

        Ok(outcome)
    }

    /// Current counters. Cheap enough to poll.
    pub fn progress(&self) -> BatchProgress {
        let run = self.shared.lock_run();
        let done = run.processed_count + run.failed_count;
        let percentage = if run.total == 0 {
            0
        } else {
            (done as f64 / run.total as f64 * 100.0).round() as u8
        };
        BatchProgress {
            status: run.status,
            total: run.total,
            processed: run.processed_count,
            failed: run.failed_count,
            percentage,
        }
    }

    /// Request cancellation of the running batch.
    ///
    /// Unstarted items are dropped; items being analyzed finish. The pending
    /// `execute()` then returns with `cancelled = true`. Returns `false` if no
    /// batch was running.
    pub fn cancel(&self) -> bool {
        let batch_id = {
            let run = self.shared.lock_run();
            if run.status != BatchStatus::Running {
                return false;
            }
            run.batch_id.clone()
        };
        self.shared.request_cancel(&batch_id)
    }

    /// Whether a batch is running and still taking new items.
    ///
    /// `false` while a cancelled batch drains; `execute()` is still rejected then.
    pub fn is_running(&self) -> bool {
        self.shared.lock_run().status == BatchStatus::Running
    }
}

async fn worker_loop<A: ItemAnalyzer>(
    worker: usize,
    batch_id: String,
    shared: Arc<Shared>,
    analyzer: Arc<A>,
    options: BatchOptions,
) {
    while let Some(item) = shared.next_item(&batch_id) {

        tracing::debug!(
            batch_id = %batch_id,
            worker,
            item_id = %item.item_id,
            "Analyzing item"
        );
        let result = AssertUnwindSafe(analyzer.analyze(&item.item_id, &item.settings))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(analysis)) => shared.record_success(&batch_id, item.item_id, analysis),
            Ok(Err(e)) => {
                tracing::warn!(
                    batch_id = %batch_id,
                    item_id = %item.item_id,
                    error = %e,
                    "Item analysis failed"
                );
                shared.record_failure(&batch_id, item.item_id, e.to_string());
                if !options.continue_on_error {
                    shared.request_cancel(&batch_id);
                }
            }
            Err(panic) => {
                let fatal = TaggerError::WorkerFatal(panic_message(panic.as_ref()));
                tracing::error!(
                    batch_id = %batch_id,
                    worker,
                    item_id = %item.item_id,
                    error = %fatal,
                    "Worker fault"
                );
                shared.record_failure(&batch_id, item.item_id, fatal.to_string());
                if !options.continue_on_error {
                    shared.mark_faulted(&batch_id);
                    shared.request_cancel(&batch_id);
                }
            }
        }

        if !options.delay_between_items.is_zero() {
            tokio::time::sleep(options.delay_between_items).await;
        }
    }
    tracing::debug!(batch_id = %batch_id, worker, "Worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "analyzer panicked".to_string()
    }
}
