use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{Job, JobProgress, JobStatus};
use crate::store::{CancelOutcome, JobOutcome, JobStore, StoreError};

const JOB_COLUMNS: &str = "id, kind, priority, target_fingerprint, status, created_at, \
     started_at, finished_at, progress, result, error, retry_count, max_retries, \
     owner_context, cancel_requested";

/// Job store backed by PostgreSQL. Per-job atomicity comes from
/// single-statement conditional updates; create and finalize wrap the
/// dedup index writes in a transaction.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
        let status: String = row.try_get("status").map_err(StoreError::Database)?;
        let priority: String = row.try_get("priority").map_err(StoreError::Database)?;
        Ok(Job {
            id: row.try_get("id").map_err(StoreError::Database)?,
            kind: serde_json::from_value(row.try_get("kind").map_err(StoreError::Database)?)?,
            priority: priority.parse().unwrap_or_default(),
            target_fingerprint: row
                .try_get("target_fingerprint")
                .map_err(StoreError::Database)?,
            status: status.parse().unwrap_or(JobStatus::Queued),
            created_at: row.try_get("created_at").map_err(StoreError::Database)?,
            started_at: row.try_get("started_at").map_err(StoreError::Database)?,
            finished_at: row.try_get("finished_at").map_err(StoreError::Database)?,
            progress: serde_json::from_value(
                row.try_get("progress").map_err(StoreError::Database)?,
            )?,
            result: row
                .try_get::<Option<serde_json::Value>, _>("result")
                .map_err(StoreError::Database)?
                .map(serde_json::from_value)
                .transpose()?,
            error: row
                .try_get::<Option<serde_json::Value>, _>("error")
                .map_err(StoreError::Database)?
                .map(serde_json::from_value)
                .transpose()?,
            retry_count: row.try_get::<i32, _>("retry_count").map_err(StoreError::Database)? as u32,
            max_retries: row.try_get::<i32, _>("max_retries").map_err(StoreError::Database)? as u32,
            owner_context: row.try_get("owner_context").map_err(StoreError::Database)?,
            cancel_requested: row.try_get("cancel_requested").map_err(StoreError::Database)?,
        })
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(&self, job: Job) -> Result<Uuid, StoreError> {
        loop {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
                INSERT INTO analysis_jobs
                    (id, kind, priority, target_fingerprint, status, created_at, progress,
                     retry_count, max_retries, owner_context, cancel_requested)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE)
                "#,
            )
            .bind(job.id)
            .bind(serde_json::to_value(&job.kind)?)
            .bind(job.priority.to_string())
            .bind(&job.target_fingerprint)
            .bind(job.status.to_string())
            .bind(job.created_at)
            .bind(serde_json::to_value(&job.progress)?)
            .bind(job.retry_count as i32)
            .bind(job.max_retries as i32)
            .bind(&job.owner_context)
            .execute(&mut *tx)
            .await?;

            let reserved = sqlx::query(
                r#"
                INSERT INTO inflight_targets (fingerprint, job_id)
                VALUES ($1, $2)
                ON CONFLICT (fingerprint) DO NOTHING
                "#,
            )
            .bind(&job.target_fingerprint)
            .bind(job.id)
            .execute(&mut *tx)
            .await?;

            if reserved.rows_affected() == 1 {
                tx.commit().await?;
                return Ok(job.id);
            }

            tx.rollback().await?;
            let holder =
                sqlx::query("SELECT job_id FROM inflight_targets WHERE fingerprint = $1")
                    .bind(&job.target_fingerprint)
                    .fetch_optional(&self.pool)
                    .await?;
            match holder {
                Some(row) => {
                    return Err(StoreError::DuplicateTarget {
                        fingerprint: job.target_fingerprint,
                        existing: row.try_get("job_id")?,
                    });
                }
                // The holder finalized between our insert and the lookup;
                // the fingerprint is free again, so retry the create.
                None => continue,
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.fetch(id).await
    }

    async fn cas_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<Job, StoreError> {
        if !expected.can_transition_to(next) {
            return Err(StoreError::InvalidTransition { id, from: expected, to: next });
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE analysis_jobs
            SET status = $3,
                started_at = CASE WHEN $3 = 'running' THEN NOW() ELSE started_at END,
                finished_at = CASE WHEN $3 IN ('finished', 'failed', 'cancelled')
                              THEN NOW() ELSE finished_at END
            WHERE id = $1 AND status = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(expected.to_string())
        .bind(next.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::job_from_row(&row),
            None => match self.fetch(id).await? {
                Some(job) => {
                    Err(StoreError::InvalidTransition { id, from: job.status, to: next })
                }
                None => Err(StoreError::NotFound(id)),
            },
        }
    }

    async fn update_progress(&self, id: Uuid, progress: JobProgress) -> Result<(), StoreError> {
        if progress.completed_items > progress.total_items {
            return Err(StoreError::ProgressRegression {
                id,
                from: progress.total_items,
                to: progress.completed_items,
            });
        }

        let updated = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET progress = $2
            WHERE id = $1
              AND status NOT IN ('finished', 'failed', 'cancelled')
              AND (progress->>'completed_items')::INTEGER <= $3
            "#,
        )
        .bind(id)
        .bind(serde_json::to_value(&progress)?)
        .bind(progress.completed_items as i32)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        match self.fetch(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(job) if job.status.is_terminal() => {
                Err(StoreError::InvalidTransition { id, from: job.status, to: job.status })
            }
            Some(job) => Err(StoreError::ProgressRegression {
                id,
                from: job.progress.completed_items,
                to: progress.completed_items,
            }),
        }
    }

    async fn increment_retry(&self, id: Uuid) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET retry_count = retry_count + 1
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        Ok(row.try_get::<i32, _>("retry_count")? as u32)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status FROM analysis_jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let status: JobStatus = row
            .try_get::<String, _>("status")?
            .parse()
            .unwrap_or(JobStatus::Queued);

        let outcome = match status {
            JobStatus::Queued => {
                sqlx::query(
                    "UPDATE analysis_jobs SET status = 'cancelled', finished_at = NOW() \
                     WHERE id = $1",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM inflight_targets WHERE job_id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                CancelOutcome::Cancelled
            }
            JobStatus::Running => {
                sqlx::query("UPDATE analysis_jobs SET cancel_requested = TRUE WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                CancelOutcome::CancellationRequested
            }
            terminal => CancelOutcome::AlreadyTerminal(terminal),
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT cancel_requested FROM analysis_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        Ok(row.try_get("cancel_requested")?)
    }

    async fn finalize(&self, id: Uuid, outcome: JobOutcome) -> Result<(), StoreError> {
        let next = outcome.status();
        let (result, error) = match &outcome {
            JobOutcome::Finished(result) => (Some(serde_json::to_value(result)?), None),
            JobOutcome::Failed(info) => (None, Some(serde_json::to_value(info)?)),
            JobOutcome::Cancelled(partial) => (
                partial.as_ref().map(serde_json::to_value).transpose()?,
                None,
            ),
        };

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET status = $2, result = $3, error = $4, finished_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(next.to_string())
        .bind(result)
        .bind(error)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return match self.fetch(id).await? {
                Some(job) => {
                    Err(StoreError::InvalidTransition { id, from: job.status, to: next })
                }
                None => Err(StoreError::NotFound(id)),
            };
        }

        sqlx::query("DELETE FROM inflight_targets WHERE job_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn evict_expired(&self, retention: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let deleted = sqlx::query(
            r#"
            DELETE FROM analysis_jobs
            WHERE status IN ('finished', 'failed', 'cancelled') AND finished_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(deleted.rows_affected())
    }

    async fn in_flight_job(&self, fingerprint: &str) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query("SELECT job_id FROM inflight_targets WHERE fingerprint = $1")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get("job_id").map_err(StoreError::Database)).transpose()
    }
}
