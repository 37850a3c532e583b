use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::models::api::{QueueStatsResponse, QueuedByPriority};

/// GET /queue/stats — operational snapshot of the broker.
pub async fn queue_stats(
    State(state): State<AppState>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let stats = state.queue.stats().await?;

    let depth = stats.queued_high + stats.queued_default + stats.queued_low;
    metrics::gauge!("analysis_queue_depth").set(depth as f64);

    Ok(Json(QueueStatsResponse {
        queued_by_priority: QueuedByPriority {
            high: stats.queued_high,
            default: stats.queued_default,
            low: stats.queued_low,
        },
        active_workers: stats.active_workers,
        oldest_queued_age_seconds: stats.oldest_queued_age_seconds,
    }))
}
