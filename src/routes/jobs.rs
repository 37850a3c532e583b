use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::models::api::{
    CancelJobResponse, JobStatusResponse, SubmitJobRequest, SubmitJobResponse,
};
use crate::models::job::Job;
use crate::queue::QueueEntry;
use crate::store::{CancelOutcome, StoreError};

/// POST /jobs — submit a track or playlist for analysis.
///
/// Submission is idempotent per target: if the fingerprint already has a
/// job in flight, the existing job id is returned with status "reused"
/// instead of an error.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    request
        .validate()
        .map_err(|report| ApiError::Validation(report.to_string()))?;
    let (kind, priority, fingerprint, owner) =
        request.into_kind().map_err(ApiError::Validation)?;

    let job = Job::new(kind, priority, fingerprint, state.max_retries, owner);
    let job_id = job.id;

    match state.store.create(job).await {
        Ok(id) => {
            debug_assert_eq!(id, job_id);
            state.queue.push(QueueEntry::new(id, priority)).await?;
            metrics::counter!("analysis_jobs_submitted_total").increment(1);
            tracing::info!(job_id = %id, priority = %priority, "Job queued");
            Ok((
                StatusCode::ACCEPTED,
                Json(SubmitJobResponse { job_id: id, status: "queued".to_string() }),
            ))
        }
        Err(StoreError::DuplicateTarget { existing, fingerprint }) => {
            tracing::debug!(
                job_id = %existing,
                fingerprint = %fingerprint,
                "Reusing in-flight job for duplicate target"
            );
            Ok((
                StatusCode::OK,
                Json(SubmitJobResponse { job_id: existing, status: "reused".to_string() }),
            ))
        }
        Err(e) => Err(e.into()),
    }
}

/// GET /jobs/{job_id} — status, progress and (when terminal) result or
/// error. Pure read; 404 for unknown or evicted ids.
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state.store.get(job_id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(JobStatusResponse::from_job(&job)))
}

/// POST /jobs/{job_id}/cancel — cancel a queued job outright, or request
/// cooperative cancellation of a running one.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelJobResponse>, ApiError> {
    let outcome = state.store.request_cancel(job_id).await?;
    let status = match outcome {
        CancelOutcome::Cancelled => "cancelled".to_string(),
        CancelOutcome::CancellationRequested => "cancellation_requested".to_string(),
        CancelOutcome::AlreadyTerminal(status) => status.to_string(),
    };
    tracing::info!(job_id = %job_id, status = %status, "Cancellation requested");
    Ok(Json(CancelJobResponse { job_id, status }))
}
