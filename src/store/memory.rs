use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::job::{Job, JobProgress, JobStatus};
use crate::store::{CancelOutcome, JobOutcome, JobStore, StoreError};

/// In-process job store used by tests and single-process deployments.
/// The fingerprint index is guarded together with the job map so reserve
/// and release stay atomic with create and finalize.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    in_flight: HashMap<String, Uuid>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.in_flight.get(&job.target_fingerprint) {
            return Err(StoreError::DuplicateTarget {
                fingerprint: job.target_fingerprint.clone(),
                existing: *existing,
            });
        }
        let id = job.id;
        inner.in_flight.insert(job.target_fingerprint.clone(), id);
        inner.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.read().unwrap().jobs.get(&id).cloned())
    }

    async fn cas_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<Job, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != expected || !job.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition { id, from: job.status, to: next });
        }
        job.status = next;
        if next == JobStatus::Running {
            job.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            job.finished_at = Some(Utc::now());
        }
        Ok(job.clone())
    }

    async fn update_progress(&self, id: Uuid, progress: JobProgress) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(StoreError::InvalidTransition { id, from: job.status, to: job.status });
        }
        if progress.completed_items < job.progress.completed_items
            || progress.completed_items > progress.total_items
        {
            return Err(StoreError::ProgressRegression {
                id,
                from: job.progress.completed_items,
                to: progress.completed_items,
            });
        }
        job.progress = progress;
        Ok(())
    }

    async fn increment_retry(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.retry_count += 1;
        Ok(job.retry_count)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(Utc::now());
                let fingerprint = job.target_fingerprint.clone();
                inner.in_flight.remove(&fingerprint);
                Ok(CancelOutcome::Cancelled)
            }
            JobStatus::Running => {
                job.cancel_requested = true;
                Ok(CancelOutcome::CancellationRequested)
            }
            terminal => Ok(CancelOutcome::AlreadyTerminal(terminal)),
        }
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        let inner = self.inner.read().unwrap();
        let job = inner.jobs.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(job.cancel_requested)
    }

    async fn finalize(&self, id: Uuid, outcome: JobOutcome) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let next = outcome.status();
        if !job.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition { id, from: job.status, to: next });
        }
        job.status = next;
        job.finished_at = Some(Utc::now());
        match outcome {
            JobOutcome::Finished(result) => job.result = Some(result),
            JobOutcome::Failed(error) => job.error = Some(error),
            JobOutcome::Cancelled(partial) => job.result = partial,
        }
        let fingerprint = job.target_fingerprint.clone();
        inner.in_flight.remove(&fingerprint);
        Ok(())
    }

    async fn evict_expired(&self, retention: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut inner = self.inner.write().unwrap();
        let expired: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| {
                job.status.is_terminal()
                    && job.finished_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .map(|job| job.id)
            .collect();
        for id in &expired {
            inner.jobs.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn in_flight_job(&self, fingerprint: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self.inner.read().unwrap().in_flight.get(fingerprint).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{
        ErrorKind, ItemOutcome, JobErrorInfo, JobKind, JobResult, Priority, TrackRef,
    };

    fn track_job(fingerprint: &str) -> Job {
        Job::new(
            JobKind::Track {
                track: TrackRef { id: "t1".into(), label: "Artist - Song".into() },
            },
            Priority::Default,
            fingerprint.into(),
            3,
            None,
        )
    }

    #[tokio::test]
    async fn duplicate_fingerprint_returns_existing_id() {
        let store = MemoryJobStore::new();
        let first = store.create(track_job("fp")).await.unwrap();

        let err = store.create(track_job("fp")).await.unwrap_err();
        match err {
            StoreError::DuplicateTarget { existing, .. } => assert_eq!(existing, first),
            other => panic!("expected DuplicateTarget, got {other}"),
        }
        assert_eq!(store.in_flight_job("fp").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn finalize_releases_fingerprint_for_resubmission() {
        let store = MemoryJobStore::new();
        let id = store.create(track_job("fp")).await.unwrap();
        store.cas_status(id, JobStatus::Queued, JobStatus::Running).await.unwrap();
        store
            .finalize(
                id,
                JobOutcome::Failed(JobErrorInfo::new(ErrorKind::TransientAnalyzer, "timeout")),
            )
            .await
            .unwrap();

        assert_eq!(store.in_flight_job("fp").await.unwrap(), None);
        let second = store.create(track_job("fp")).await.unwrap();
        assert_ne!(second, id);
    }

    #[tokio::test]
    async fn cas_rejects_stale_expected_status() {
        let store = MemoryJobStore::new();
        let id = store.create(track_job("fp")).await.unwrap();
        store.cas_status(id, JobStatus::Queued, JobStatus::Running).await.unwrap();

        // Second claimant loses the race; stored state is untouched.
        let err = store.cas_status(id, JobStatus::Queued, JobStatus::Running).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn finalize_from_terminal_state_is_rejected() {
        let store = MemoryJobStore::new();
        let id = store.create(track_job("fp")).await.unwrap();
        store.cas_status(id, JobStatus::Queued, JobStatus::Running).await.unwrap();
        let outcome = JobOutcome::Finished(JobResult::Track(ItemOutcome::Overridden {
            track_id: "t1".into(),
            decision: crate::models::job::OverrideDecision::ForceApprove,
        }));
        store.finalize(id, outcome.clone()).await.unwrap();

        let err = store.finalize(id, outcome).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn progress_never_regresses() {
        let store = MemoryJobStore::new();
        let mut job = track_job("fp");
        job.kind = JobKind::Playlist {
            tracks: vec![
                TrackRef { id: "a".into(), label: "A".into() },
                TrackRef { id: "b".into(), label: "B".into() },
            ],
        };
        job.progress = JobProgress::new(2);
        let id = store.create(job).await.unwrap();
        store.cas_status(id, JobStatus::Queued, JobStatus::Running).await.unwrap();

        let mut progress = JobProgress::new(2);
        progress.completed_items = 1;
        store.update_progress(id, progress.clone()).await.unwrap();

        progress.completed_items = 0;
        let err = store.update_progress(id, progress).await.unwrap_err();
        assert!(matches!(err, StoreError::ProgressRegression { .. }));
    }

    #[tokio::test]
    async fn queued_cancel_is_immediate_and_releases_target() {
        let store = MemoryJobStore::new();
        let id = store.create(track_job("fp")).await.unwrap();

        let outcome = store.request_cancel(id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.finished_at.is_some());
        assert_eq!(store.in_flight_job("fp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn running_cancel_sets_cooperative_flag() {
        let store = MemoryJobStore::new();
        let id = store.create(track_job("fp")).await.unwrap();
        store.cas_status(id, JobStatus::Queued, JobStatus::Running).await.unwrap();

        let outcome = store.request_cancel(id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::CancellationRequested);
        assert!(store.cancel_requested(id).await.unwrap());
        // Still running until the worker notices.
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn eviction_drops_only_expired_terminal_jobs() {
        let store = MemoryJobStore::new();
        let done = store.create(track_job("fp-done")).await.unwrap();
        store.cas_status(done, JobStatus::Queued, JobStatus::Running).await.unwrap();
        store
            .finalize(
                done,
                JobOutcome::Failed(JobErrorInfo::new(ErrorKind::PermanentAnalyzer, "rejected")),
            )
            .await
            .unwrap();
        let queued = store.create(track_job("fp-queued")).await.unwrap();

        // Zero retention: everything terminal is already expired.
        let evicted = store.evict_expired(Duration::from_secs(0)).await.unwrap();
        assert_eq!(evicted, 1);
        assert!(store.get(done).await.unwrap().is_none());
        assert!(store.get(queued).await.unwrap().is_some());
    }
}
