use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::models::job::{
    BatchSummary, ErrorKind, ItemOutcome, Job, JobErrorInfo, JobKind, JobProgress, JobResult,
    JobStatus, TrackRef,
};
use crate::queue::{JobQueue, QueueError};
use crate::services::analyzer::{Analyzer, AnalyzerError};
use crate::services::eta::EtaTracker;
use crate::services::overrides::OverrideStore;
use crate::services::sink::ResultSink;
use crate::store::{JobOutcome, JobStore, StoreError};

/// Knobs for the worker loop, independent of queue depth.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Per-item analyzer call timeout.
    pub item_timeout: Duration,
    /// Base delay for exponential retry backoff.
    pub retry_backoff: Duration,
    /// Sleep between polls when the queue is empty.
    pub idle_sleep: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            item_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(500),
            idle_sleep: Duration::from_millis(1000),
        }
    }
}

/// Everything a worker needs, shared across the pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub analyzer: Arc<dyn Analyzer>,
    pub overrides: Arc<dyn OverrideStore>,
    pub sink: Arc<dyn ResultSink>,
    pub config: WorkerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Spawn `count` long-lived workers onto the runtime.
pub fn spawn_pool(ctx: WorkerContext, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let ctx = ctx.clone();
            tokio::spawn(run_worker(ctx, worker_id))
        })
        .collect()
}

/// Main processing loop: dequeue, claim, execute, finalize, forever.
pub async fn run_worker(ctx: WorkerContext, worker_id: usize) {
    tracing::info!(worker_id, "Worker ready, starting job processing loop");
    loop {
        match process_one(&ctx).await {
            Ok(true) => {
                tracing::debug!(worker_id, "Job processed, checking for next job");
            }
            Ok(false) => {
                tracing::trace!(worker_id, "No jobs available, sleeping");
                sleep(ctx.config.idle_sleep).await;
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Error processing job, will retry");
                sleep(ctx.config.idle_sleep).await;
            }
        }
    }
}

/// Process the next job from the queue.
/// Returns Ok(true) if a queue entry was consumed, Ok(false) if the queue
/// was empty.
pub async fn process_one(ctx: &WorkerContext) -> Result<bool, WorkerError> {
    let entry = match ctx.queue.pop().await? {
        Some(entry) => entry,
        None => return Ok(false),
    };

    let job = match ctx.store.get(entry.job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            tracing::warn!(job_id = %entry.job_id, "Queue entry references evicted job, dropping");
            return Ok(true);
        }
        Err(e) => {
            // Infrastructure hiccup before the claim: the entry goes back
            // with its original priority and ordering slot.
            ctx.queue.requeue(entry).await?;
            return Err(e.into());
        }
    };

    // Claim. Losing the race (or finding the job cancelled while queued)
    // just drops the entry.
    let job = match ctx.store.cas_status(job.id, JobStatus::Queued, JobStatus::Running).await {
        Ok(job) => job,
        Err(StoreError::InvalidTransition { from, .. }) => {
            tracing::debug!(job_id = %job.id, status = %from, "Job no longer claimable, skipping");
            return Ok(true);
        }
        Err(e) => {
            ctx.queue.requeue(entry).await?;
            return Err(e.into());
        }
    };

    tracing::info!(
        job_id = %job.id,
        fingerprint = %job.target_fingerprint,
        total_items = job.progress.total_items,
        "Processing analysis job"
    );

    if let Err(e) = ctx.queue.add_active_workers(1).await {
        tracing::warn!(error = %e, "Failed to bump active worker count");
    }
    let started = Instant::now();
    let executed = execute_job(ctx, &job).await;
    if let Err(e) = ctx.queue.add_active_workers(-1).await {
        tracing::warn!(error = %e, "Failed to drop active worker count");
    }

    match executed {
        Ok(outcome) => {
            let final_status = outcome.status();
            ctx.store.finalize(job.id, outcome).await?;
            metrics::histogram!("job_processing_seconds").record(started.elapsed().as_secs_f64());
            match final_status {
                JobStatus::Failed => {
                    metrics::counter!("analysis_jobs_failed_total").increment(1)
                }
                _ => metrics::counter!("analysis_jobs_completed_total").increment(1),
            }
            tracing::info!(job_id = %job.id, status = %final_status, "Job finalized");
            Ok(true)
        }
        Err(e) => {
            // Job-level infrastructure failure mid-execution. Mark the job
            // failed so it does not sit in Running forever; if even that
            // write fails, the error is logged and surfaced to the loop.
            tracing::error!(job_id = %job.id, error = %e, "Job execution aborted");
            let info = JobErrorInfo::new(ErrorKind::Internal, e.to_string());
            if let Err(finalize_err) = ctx.store.finalize(job.id, JobOutcome::Failed(info)).await
            {
                tracing::error!(job_id = %job.id, error = %finalize_err, "Failed to finalize aborted job");
            }
            metrics::counter!("analysis_jobs_failed_total").increment(1);
            Err(e)
        }
    }
}

/// Run every item of a job, accumulating outcomes locally; nothing but
/// progress counters is written until the single finalize step.
async fn execute_job(ctx: &WorkerContext, job: &Job) -> Result<JobOutcome, WorkerError> {
    let items = job.kind.items();
    let total = items.len() as u32;
    let mut outcomes: Vec<ItemOutcome> = Vec::with_capacity(items.len());
    let mut tracker = EtaTracker::default();
    let mut cancelled = false;

    for (index, track) in items.iter().enumerate() {
        // Cooperative cancellation: checked at item boundaries only,
        // never mid-item.
        if ctx.store.cancel_requested(job.id).await? {
            tracing::info!(job_id = %job.id, completed = index, "Cancellation observed, stopping");
            cancelled = true;
            break;
        }

        let completed = index as u32;
        ctx.store
            .update_progress(
                job.id,
                JobProgress {
                    completed_items: completed,
                    total_items: total,
                    current_item_label: Some(track.label.clone()),
                    eta_seconds: tracker.eta_seconds(total - completed),
                },
            )
            .await?;

        let item_started = Instant::now();
        let outcome = process_item(ctx, job, track).await?;
        tracker.record(item_started.elapsed());

        if let ItemOutcome::Failed { error, .. } = &outcome {
            tracing::warn!(
                job_id = %job.id,
                track_id = %track.id,
                kind = %error.kind,
                "Item failed, continuing batch"
            );
        }
        outcomes.push(outcome);

        ctx.store
            .update_progress(
                job.id,
                JobProgress {
                    completed_items: completed + 1,
                    total_items: total,
                    current_item_label: None,
                    eta_seconds: tracker.eta_seconds(total - completed - 1),
                },
            )
            .await?;
    }

    if cancelled {
        let partial = match &job.kind {
            JobKind::Track { .. } => None,
            JobKind::Playlist { .. } => {
                Some(JobResult::Playlist(BatchSummary::from_outcomes(outcomes)))
            }
        };
        return Ok(JobOutcome::Cancelled(partial));
    }

    match &job.kind {
        JobKind::Track { .. } => match outcomes.into_iter().next() {
            Some(ItemOutcome::Failed { error, .. }) => Ok(JobOutcome::Failed(error)),
            Some(outcome) => Ok(JobOutcome::Finished(JobResult::Track(outcome))),
            None => Ok(JobOutcome::Failed(JobErrorInfo::new(
                ErrorKind::Internal,
                "job finished with no item outcome",
            ))),
        },
        JobKind::Playlist { .. } => {
            let summary = BatchSummary::from_outcomes(outcomes);
            if summary.succeeded == 0 && summary.failed > 0 {
                // Every item failed: the batch itself is a failure.
                let kind = summary
                    .outcomes
                    .iter()
                    .rev()
                    .find_map(|outcome| match outcome {
                        ItemOutcome::Failed { error, .. } => Some(error.kind),
                        _ => None,
                    })
                    .unwrap_or(ErrorKind::Internal);
                Ok(JobOutcome::Failed(JobErrorInfo::new(
                    kind,
                    format!("all {} items failed", summary.failed),
                )))
            } else {
                Ok(JobOutcome::Finished(JobResult::Playlist(summary)))
            }
        }
    }
}

/// One item: override short-circuit, else analyze (with retries), then
/// persist (with its own retries).
async fn process_item(
    ctx: &WorkerContext,
    job: &Job,
    track: &TrackRef,
) -> Result<ItemOutcome, WorkerError> {
    match ctx.overrides.lookup(&track.id).await {
        Ok(Some(decision)) => {
            tracing::debug!(job_id = %job.id, track_id = %track.id, ?decision, "Override hit, skipping analyzer");
            return Ok(ItemOutcome::Overridden { track_id: track.id.clone(), decision });
        }
        Ok(None) => {}
        Err(e) => {
            // Override lookup trouble must not block analysis.
            tracing::warn!(track_id = %track.id, error = %e, "Override lookup failed, analyzing anyway");
        }
    }

    let verdict = match analyze_with_retry(ctx, job, track).await? {
        Ok(verdict) => verdict,
        Err(error) => return Ok(ItemOutcome::Failed { track_id: track.id.clone(), error }),
    };

    if let Err(error) = persist_with_retry(ctx, job, track, &verdict).await? {
        return Ok(ItemOutcome::Failed { track_id: track.id.clone(), error });
    }

    Ok(ItemOutcome::Analyzed { track_id: track.id.clone(), verdict })
}

/// Call the analyzer, retrying transient failures with exponential
/// backoff while the job's retry budget lasts. The outer Result carries
/// infrastructure errors; the inner one the item's fate.
async fn analyze_with_retry(
    ctx: &WorkerContext,
    job: &Job,
    track: &TrackRef,
) -> Result<Result<crate::models::job::AnalysisVerdict, JobErrorInfo>, WorkerError> {
    let mut retries = 0u32;
    loop {
        match ctx.analyzer.analyze(track, ctx.config.item_timeout).await {
            Ok(verdict) => return Ok(Ok(verdict)),
            Err(AnalyzerError::Permanent(message)) => {
                return Ok(Err(JobErrorInfo::new(ErrorKind::PermanentAnalyzer, message)));
            }
            Err(AnalyzerError::Transient(message)) => {
                if retries >= job.max_retries {
                    return Ok(Err(JobErrorInfo::new(
                        ErrorKind::TransientAnalyzer,
                        format!("{message} (gave up after {retries} retries)"),
                    )));
                }
                retries += 1;
                ctx.store.increment_retry(job.id).await?;
                let backoff = ctx.config.retry_backoff * 2u32.saturating_pow(retries - 1);
                tracing::warn!(
                    job_id = %job.id,
                    track_id = %track.id,
                    retry = retries,
                    backoff_ms = backoff.as_millis() as u64,
                    "Transient analyzer failure, backing off"
                );
                sleep(backoff).await;
            }
        }
    }
}

/// Persist a verdict, retrying independently of the analyzer call so a
/// flaky database never forces a wasteful re-analysis.
async fn persist_with_retry(
    ctx: &WorkerContext,
    job: &Job,
    track: &TrackRef,
    verdict: &crate::models::job::AnalysisVerdict,
) -> Result<Result<(), JobErrorInfo>, WorkerError> {
    let mut retries = 0u32;
    loop {
        match ctx.sink.persist(track, verdict).await {
            Ok(()) => return Ok(Ok(())),
            Err(e) => {
                if retries >= job.max_retries {
                    return Ok(Err(JobErrorInfo::new(ErrorKind::Persistence, e.to_string())));
                }
                retries += 1;
                ctx.store.increment_retry(job.id).await?;
                let backoff = ctx.config.retry_backoff * 2u32.saturating_pow(retries - 1);
                tracing::warn!(
                    job_id = %job.id,
                    track_id = %track.id,
                    retry = retries,
                    error = %e,
                    "Result persistence failed, backing off"
                );
                sleep(backoff).await;
            }
        }
    }
}
