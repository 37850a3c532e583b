use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::Priority;

pub mod memory;
pub mod redis;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

/// Lightweight queue pointer: jobs themselves live in the job store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub priority: Priority,
    /// Ordering timestamp within a tier. Never refreshed, so a retried
    /// job does not jump ahead of fresh submissions at the same tier.
    pub enqueued_at: DateTime<Utc>,
    /// Promotion clock; set on requeue so a retried entry waits a full
    /// threshold again before being bumped a tier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requeued_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(job_id: Uuid, priority: Priority) -> Self {
        Self { job_id, priority, enqueued_at: Utc::now(), requeued_at: None }
    }

    /// Timestamp the starvation-promotion check ages against.
    pub fn promotion_basis(&self) -> DateTime<Utc> {
        self.requeued_at.unwrap_or(self.enqueued_at)
    }
}

/// Snapshot served by GET /queue/stats.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub queued_high: u64,
    pub queued_default: u64,
    pub queued_low: u64,
    pub active_workers: u64,
    pub oldest_queued_age_seconds: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Priority queue broker shared by submission and worker code paths.
///
/// Ordering: (priority tier, enqueued_at) ascending. `pop` is
/// non-blocking; workers poll with an idle sleep. Entries stale past the
/// promotion threshold are bumped one tier before each pop so sustained
/// high-priority load cannot starve low-priority work forever.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, entry: QueueEntry) -> Result<(), QueueError>;

    /// Remove and return the highest-priority, oldest entry, if any.
    async fn pop(&self) -> Result<Option<QueueEntry>, QueueError>;

    /// Put a claimed-but-unprocessable entry back, preserving its
    /// original priority and ordering timestamp.
    async fn requeue(&self, entry: QueueEntry) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Worker bookkeeping surfaced through /queue/stats.
    async fn add_active_workers(&self, delta: i64) -> Result<(), QueueError>;

    /// Broker connectivity probe for health checks.
    async fn health_check(&self) -> Result<(), QueueError>;
}
