use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{
    Job, JobErrorInfo, JobKind, JobProgress, JobResult, JobStatus, Priority, TrackRef,
};

/// Kind discriminator for a submission.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmitKind {
    Track,
    Playlist,
}

/// POST /jobs request body.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitJobRequest {
    #[garde(skip)]
    pub kind: SubmitKind,

    /// Stable identity of the target (track id, or playlist snapshot id).
    #[garde(length(min = 1, max = 256))]
    pub target_fingerprint: String,

    #[garde(skip)]
    #[serde(default)]
    pub priority: Priority,

    #[garde(length(min = 1, max = 5000), dive)]
    pub items: Vec<TrackRef>,

    /// Opaque caller identity, stored untouched for the caller's own
    /// authorization checks.
    #[garde(inner(length(max = 256)))]
    pub owner: Option<String>,
}

impl SubmitJobRequest {
    /// Shape the validated request into a job kind. A `track` submission
    /// must carry exactly one item; garde has already bounded the list.
    pub fn into_kind(self) -> Result<(JobKind, Priority, String, Option<String>), String> {
        let kind = match self.kind {
            SubmitKind::Track => {
                if self.items.len() != 1 {
                    return Err(format!(
                        "track submission requires exactly one item, got {}",
                        self.items.len()
                    ));
                }
                JobKind::Track { track: self.items.into_iter().next().unwrap() }
            }
            SubmitKind::Playlist => JobKind::Playlist { tracks: self.items },
        };
        Ok((kind, self.priority, self.target_fingerprint, self.owner))
    }
}

/// POST /jobs response.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    /// "queued" for a new job, "reused" when the fingerprint was already
    /// in flight and the existing job is returned.
    pub status: String,
}

/// GET /jobs/{id} response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Human-readable summary, e.g. "analyzing item 3 of 12" or
    /// "9 of 12 succeeded".
    pub summary: String,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorInfo>,
}

impl JobStatusResponse {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            summary: summarize(job),
            progress: job.progress.clone(),
            result: job.result.clone(),
            error: job.error.clone(),
        }
    }
}

fn summarize(job: &Job) -> String {
    match job.status {
        JobStatus::Queued => "waiting in queue".to_string(),
        JobStatus::Running => match &job.progress.current_item_label {
            Some(label) => format!(
                "analyzing item {} of {}: {}",
                job.progress.completed_items + 1,
                job.progress.total_items,
                label
            ),
            None => format!(
                "analyzing item {} of {}",
                job.progress.completed_items + 1,
                job.progress.total_items
            ),
        },
        JobStatus::Finished => match &job.result {
            Some(JobResult::Playlist(summary)) => format!(
                "{} of {} succeeded",
                summary.succeeded,
                summary.succeeded + summary.failed
            ),
            _ => "analysis complete".to_string(),
        },
        JobStatus::Failed => match &job.error {
            Some(error) => format!("failed: {}", error.message),
            None => "failed".to_string(),
        },
        JobStatus::Cancelled => format!(
            "cancelled after {} of {} items",
            job.progress.completed_items, job.progress.total_items
        ),
    }
}

/// POST /jobs/{id}/cancel response.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelJobResponse {
    pub job_id: Uuid,
    /// Status after the cancellation request: "cancelled" when the job was
    /// still queued, "cancellation_requested" for a running job.
    pub status: String,
}

/// GET /queue/stats response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    pub queued_by_priority: QueuedByPriority,
    pub active_workers: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_queued_age_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueuedByPriority {
    pub high: u64,
    pub default: u64,
    pub low: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::BatchSummary;

    fn submission(kind: SubmitKind, items: Vec<TrackRef>) -> SubmitJobRequest {
        SubmitJobRequest {
            kind,
            target_fingerprint: "fp-1".into(),
            priority: Priority::Default,
            items,
            owner: None,
        }
    }

    fn track(id: &str) -> TrackRef {
        TrackRef { id: id.into(), label: format!("Artist - {id}") }
    }

    #[test]
    fn track_submission_requires_single_item() {
        let err = submission(SubmitKind::Track, vec![track("a"), track("b")])
            .into_kind()
            .unwrap_err();
        assert!(err.contains("exactly one item"));

        let (kind, ..) = submission(SubmitKind::Track, vec![track("a")]).into_kind().unwrap();
        assert_eq!(kind.total_items(), 1);
    }

    #[test]
    fn empty_submission_fails_validation() {
        let request = submission(SubmitKind::Playlist, vec![]);
        assert!(request.validate().is_err());
    }

    #[test]
    fn partial_batch_summarized_as_n_of_m() {
        let mut job = Job::new(
            JobKind::Playlist { tracks: vec![track("a"), track("b"), track("c")] },
            Priority::Default,
            "fp".into(),
            3,
            None,
        );
        job.status = JobStatus::Finished;
        job.result = Some(JobResult::Playlist(BatchSummary {
            succeeded: 2,
            failed: 1,
            outcomes: vec![],
        }));

        let response = JobStatusResponse::from_job(&job);
        assert_eq!(response.summary, "2 of 3 succeeded");
    }
}
