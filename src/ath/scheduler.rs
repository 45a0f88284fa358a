//! Batch scheduler: pull pending calls, resolve, persist, repeat.
//!
//! The pull query only returns calls without an ATH and the cursor only moves
//! forward, so a call is never in flight twice within a run. Per-call failures
//! become skips; only configuration-level provider errors end the run early.

use crate::ath::error::{AthError, SkipReason};
use crate::ath::metrics::{RunMetrics, RunSummary};
use crate::ath::resolver::TieredAthResolver;
use crate::ath::storage::CallStore;
use crate::ath::types::{AthConfig, ExecutionMode};
use crate::types::{AthResult, CallRecord};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

/// Drives the resolver over every pending call.
pub struct BatchScheduler {
    store: Arc<dyn CallStore>,
    resolver: Arc<TieredAthResolver>,
    worker_count: usize,
    batch_size: u32,
    execution: ExecutionMode,
    progress_interval: u64,
    shutdown: Option<watch::Receiver<bool>>,
}

/// How a batch ended.
enum BatchOutcome {
    Completed,
    Cancelled,
}

impl BatchScheduler {
    pub fn new(store: Arc<dyn CallStore>, resolver: Arc<TieredAthResolver>, config: &AthConfig) -> Self {
        Self {
            store,
            resolver,
            worker_count: config.worker_count.max(1),
            batch_size: config.batch_size.max(1),
            execution: config.execution,
            progress_interval: config.progress_interval,
            shutdown: None,
        }
    }

    /// Stop scheduling new calls once `true` is sent on this channel.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Startup check run before any call is pulled. Any error here is fatal.
    pub async fn probe_provider(&self) -> Result<(), AthError> {
        self.resolver.probe().await
    }

    /// Process pending calls until none are left, a shutdown is requested or a
    /// fatal provider error occurs.
    #[instrument(skip(self), fields(execution = ?self.execution, workers = self.worker_count))]
    pub async fn run_until_exhausted(&self) -> Result<RunSummary> {
        let metrics = Arc::new(RunMetrics::new());
        let mut cursor = None;

        info!("Starting ATH run (batch size {})", self.batch_size);

        loop {
            if self.is_cancelled() {
                info!("Shutdown requested, not pulling further batches");
                break;
            }

            let batch = self
                .store
                .pull_pending(cursor, self.batch_size)
                .await
                .context("Failed to pull pending calls")?;

            let Some(next_cursor) = batch.cursor else {
                debug!("No pending calls left");
                break;
            };
            cursor = Some(next_cursor);
            debug!("Pulled batch of {} calls up to id {}", batch.calls.len(), next_cursor);

            let outcome = match self.execution {
                ExecutionMode::Sequential => self.run_sequential(batch.calls, &metrics).await?,
                ExecutionMode::Pool => self.run_pool(batch.calls, &metrics).await?,
            };

            if let BatchOutcome::Cancelled = outcome {
                info!("Shutdown requested, stopping after in-flight calls");
                break;
            }
        }

        let summary = metrics.snapshot();
        info!("ATH run finished: {}", summary);
        Ok(summary)
    }

    async fn run_sequential(&self, calls: Vec<CallRecord>, metrics: &Arc<RunMetrics>) -> Result<BatchOutcome> {
        for call in calls {
            if self.is_cancelled() {
                return Ok(BatchOutcome::Cancelled);
            }

            process_call(
                self.store.as_ref(),
                &self.resolver,
                metrics,
                self.progress_interval,
                &call,
            )
            .await
            .map_err(|err| fatal(err, &call))?;
        }

        Ok(BatchOutcome::Completed)
    }

    async fn run_pool(&self, calls: Vec<CallRecord>, metrics: &Arc<RunMetrics>) -> Result<BatchOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let mut outcome = BatchOutcome::Completed;
        let mut fatal_error = None;

        for call in calls {
            if self.is_cancelled() {
                outcome = BatchOutcome::Cancelled;
                break;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Worker pool semaphore closed")?;

            // The permit wait can span a rate-limit pause.
            if self.is_cancelled() {
                outcome = BatchOutcome::Cancelled;
                break;
            }

            // A fatal error from a finished worker stops further scheduling.
            while let Some(joined) = workers.try_join_next() {
                collect_worker(joined, &mut fatal_error, metrics);
            }
            if fatal_error.is_some() {
                break;
            }

            let store = self.store.clone();
            let resolver = self.resolver.clone();
            let metrics = metrics.clone();
            let progress_interval = self.progress_interval;

            workers.spawn(async move {
                let _permit = permit;
                process_call(store.as_ref(), &resolver, &metrics, progress_interval, &call)
                    .await
                    .map_err(|err| (err, call.id))
            });
        }

        while let Some(joined) = workers.join_next().await {
            collect_worker(joined, &mut fatal_error, metrics);
        }

        match fatal_error {
            Some((err, call_id)) => {
                error!("Fatal provider error on call {}: {}", call_id, err);
                Err(anyhow::Error::new(err).context("Aborting ATH run"))
            }
            None => Ok(outcome),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().map_or(false, |rx| *rx.borrow())
    }
}

type WorkerResult = Result<(), (AthError, i64)>;

/// Keep the first fatal error; a worker that died counts as a skipped call.
fn collect_worker(
    joined: Result<WorkerResult, JoinError>,
    fatal_error: &mut Option<(AthError, i64)>,
    metrics: &RunMetrics,
) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            fatal_error.get_or_insert(err);
        }
        Err(join_error) => {
            warn!("ATH worker task failed, skipping its call: {}", join_error);
            metrics.record_skip(SkipReason::Malformed);
        }
    }
}

fn fatal(err: AthError, call: &CallRecord) -> anyhow::Error {
    error!("Fatal provider error on call {}: {}", call.id, err);
    anyhow::Error::new(err).context("Aborting ATH run")
}

/// Resolve and persist one call. Returns `Err` only for fatal errors; every
/// other failure is logged and tallied as a skip.
async fn process_call(
    store: &dyn CallStore,
    resolver: &TieredAthResolver,
    metrics: &RunMetrics,
    progress_interval: u64,
    call: &CallRecord,
) -> Result<(), AthError> {
    let processed = match resolver.resolve(call).await {
        Ok(result) => match persist(store, call, &result).await {
            Ok(true) => {
                debug!(
                    "Call {} ATH {} at {} (roi {}%, {} tier)",
                    call.id, result.price, result.timestamp, result.roi_percent, result.tier
                );
                metrics.record_success()
            }
            Ok(false) => {
                debug!("Call {} was resolved elsewhere, leaving it untouched", call.id);
                metrics.record_already_resolved()
            }
            Err(err) => skip(metrics, call, &err),
        },
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => skip(metrics, call, &err),
    };

    if progress_interval > 0 && processed % progress_interval == 0 {
        info!("Progress: {}", metrics.snapshot());
    }
    Ok(())
}

/// Write the result, retrying once before giving up on this run.
async fn persist(store: &dyn CallStore, call: &CallRecord, result: &AthResult) -> Result<bool, AthError> {
    match store.record_ath(call.id, result).await {
        Ok(written) => Ok(written),
        Err(first) => {
            warn!("Persisting ATH for call {} failed, retrying once: {:#}", call.id, first);
            store
                .record_ath(call.id, result)
                .await
                .map_err(|err| AthError::PersistenceFailure(format!("{:#}", err)))
        }
    }
}

fn skip(metrics: &RunMetrics, call: &CallRecord, err: &AthError) -> u64 {
    match err {
        AthError::NoData => debug!("Skipping call {} ({}): {}", call.id, call.pool_address, err),
        AthError::RateLimited => info!("Skipping call {} ({}): {}", call.id, call.pool_address, err),
        _ => warn!("Skipping call {} ({}): {}", call.id, call.pool_address, err),
    }

    match err.skip_reason() {
        Some(reason) => metrics.record_skip(reason),
        None => metrics.processed(),
    }
}
