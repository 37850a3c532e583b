use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::job::{Job, JobErrorInfo, JobProgress, JobResult, JobStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PostgresJobStore;

/// Terminal disposition handed to [`JobStore::finalize`].
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Finished(JobResult),
    Failed(JobErrorInfo),
    /// Cooperative cancellation; partial playlist outcomes are retained.
    Cancelled(Option<JobResult>),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Finished(_) => JobStatus::Finished,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::Cancelled(_) => JobStatus::Cancelled,
        }
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued and is now terminal.
    Cancelled,
    /// The job is running; the owning worker will stop at the next item
    /// boundary.
    CancellationRequested,
    /// Nothing to do; the job already reached a terminal state.
    AlreadyTerminal(JobStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("target {fingerprint} already has job {existing} in flight")]
    DuplicateTarget { fingerprint: String, existing: Uuid },

    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: JobStatus, to: JobStatus },

    #[error("progress regression for job {id}: {from} -> {to}")]
    ProgressRegression { id: Uuid, from: u32, to: u32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable key-value record of job state, shared by workers and status
/// readers. All mutations are atomic per job id; no cross-job transactions.
///
/// The deduplication index lives behind the same trait so that reserving a
/// fingerprint is atomic with `create` and releasing it is atomic with
/// `finalize`. The trait + in-memory backend split follows the job-queue
/// abstraction pattern used for worker-service dependency injection.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a queued job, reserving its target fingerprint. Fails with
    /// [`StoreError::DuplicateTarget`] carrying the in-flight job id when
    /// the fingerprint is already reserved.
    async fn create(&self, job: Job) -> Result<Uuid, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Compare-and-swap the status. Sets `started_at` on entry to
    /// `Running`. On a mismatch or an illegal edge the stored job is left
    /// untouched and [`StoreError::InvalidTransition`] is returned.
    async fn cas_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<Job, StoreError>;

    /// Overwrite progress. `completed_items` must never regress.
    async fn update_progress(&self, id: Uuid, progress: JobProgress) -> Result<(), StoreError>;

    /// Bump the retry counter, returning the new value.
    async fn increment_retry(&self, id: Uuid) -> Result<u32, StoreError>;

    /// Cancel a queued job outright, or flag a running one for cooperative
    /// cancellation.
    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError>;

    async fn cancel_requested(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Single transactional completion step: write status, timestamps and
    /// the accumulated result or error, and release the fingerprint. The
    /// store releases each fingerprint exactly once.
    async fn finalize(&self, id: Uuid, outcome: JobOutcome) -> Result<(), StoreError>;

    /// Drop terminal jobs older than the retention window. Returns the
    /// number of jobs evicted.
    async fn evict_expired(&self, retention: Duration) -> Result<u64, StoreError>;

    /// Dedup index lookup: the non-terminal job for a fingerprint, if any.
    async fn in_flight_job(&self, fingerprint: &str) -> Result<Option<Uuid>, StoreError>;
}
