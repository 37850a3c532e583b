use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::job::{AnalysisVerdict, TrackRef};

/// Persistence hook invoked once per successfully analyzed item. Upsert
/// semantics keep re-execution after a crash idempotent.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn persist(&self, track: &TrackRef, verdict: &AnalysisVerdict)
        -> Result<(), SinkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Writes verdicts to the `track_verdicts` table.
pub struct PostgresResultSink {
    pool: PgPool,
}

impl PostgresResultSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultSink for PostgresResultSink {
    async fn persist(
        &self,
        track: &TrackRef,
        verdict: &AnalysisVerdict,
    ) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO track_verdicts (track_id, verdict, analyzed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (track_id) DO UPDATE
                SET verdict = EXCLUDED.verdict, analyzed_at = NOW()
            "#,
        )
        .bind(&track.id)
        .bind(serde_json::to_value(verdict)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory sink for tests, with optional injected failures.
#[derive(Default)]
pub struct MemoryResultSink {
    records: Mutex<Vec<(String, AnalysisVerdict)>>,
    fail_next: Mutex<u32>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` persist calls fail.
    pub fn fail_next(&self, count: u32) {
        *self.fail_next.lock().unwrap() = count;
    }

    pub fn persisted(&self) -> Vec<(String, AnalysisVerdict)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn persist(
        &self,
        track: &TrackRef,
        verdict: &AnalysisVerdict,
    ) -> Result<(), SinkError> {
        {
            let mut remaining = self.fail_next.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SinkError::Database(sqlx::Error::PoolTimedOut));
            }
        }
        self.records
            .lock()
            .unwrap()
            .push((track.id.clone(), verdict.clone()));
        Ok(())
    }
}
