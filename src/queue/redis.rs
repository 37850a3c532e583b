use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;

use crate::models::job::Priority;
use crate::queue::{JobQueue, QueueEntry, QueueError, QueueStats};

const QUEUE_KEY: &str = "songscreen:queue";
const ACTIVE_WORKERS_KEY: &str = "songscreen:active_workers";

/// Tier band width in the sorted-set score: score = rank * TIER_SPAN +
/// enqueue millis. Integer scores up to ~9e15 stay exact in f64, so the
/// encoding is lossless.
const TIER_SPAN: f64 = 1e14;

/// How many stale candidates a single promotion pass examines.
const PROMOTION_SCAN_LIMIT: usize = 128;

/// Redis-backed priority queue: one sorted set holding serialized
/// [`QueueEntry`] members, scored by (tier, enqueue time). The broker is
/// process-external, so queued work survives worker restarts.
pub struct RedisQueue {
    client: redis::Client,
    promotion_threshold: std::time::Duration,
}

fn score(entry: &QueueEntry) -> f64 {
    entry.priority.rank() as f64 * TIER_SPAN + entry.enqueued_at.timestamp_millis() as f64
}

impl RedisQueue {
    pub fn new(redis_url: &str, promotion_threshold: std::time::Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client, promotion_threshold })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Bump stale non-high entries one tier. Members change shape when
    /// promoted (priority and promotion clock), so the old member is
    /// removed and a rescored one inserted.
    async fn promote_stale(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<(), QueueError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.promotion_threshold)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let candidates: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(QUEUE_KEY)
            .arg(TIER_SPAN)
            .arg("+inf")
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTION_SCAN_LIMIT)
            .query_async(conn)
            .await
            .map_err(QueueError::Redis)?;

        for member in candidates {
            let mut entry: QueueEntry = match serde_json::from_str(&member) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping undecodable queue entry");
                    conn.zrem::<_, _, ()>(QUEUE_KEY, &member)
                        .await
                        .map_err(QueueError::Redis)?;
                    continue;
                }
            };
            if entry.promotion_basis() >= cutoff {
                continue;
            }
            let removed: i64 = conn
                .zrem(QUEUE_KEY, &member)
                .await
                .map_err(QueueError::Redis)?;
            if removed == 0 {
                // Another worker popped or promoted it first.
                continue;
            }
            entry.priority = entry.priority.promoted();
            entry.requeued_at = Some(Utc::now());
            let payload = serde_json::to_string(&entry)?;
            conn.zadd::<_, _, _, ()>(QUEUE_KEY, payload, score(&entry))
                .await
                .map_err(QueueError::Redis)?;
            tracing::debug!(
                job_id = %entry.job_id,
                priority = %entry.priority,
                "Promoted stale queue entry one tier"
            );
        }
        Ok(())
    }

    async fn tier_stats(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        priority: Priority,
    ) -> Result<(u64, Option<i64>), QueueError> {
        let min = priority.rank() as f64 * TIER_SPAN;
        let max = (priority.rank() + 1) as f64 * TIER_SPAN;
        let count: u64 = conn
            .zcount(QUEUE_KEY, min, format!("({max}"))
            .await
            .map_err(QueueError::Redis)?;

        let first: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(QUEUE_KEY)
            .arg(min)
            .arg(format!("({max}"))
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(conn)
            .await
            .map_err(QueueError::Redis)?;
        let oldest_millis = first
            .first()
            .map(|(_, score)| (score % TIER_SPAN) as i64);
        Ok((count, oldest_millis))
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn push(&self, entry: QueueEntry) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(&entry)?;
        conn.zadd::<_, _, _, ()>(QUEUE_KEY, payload, score(&entry))
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<QueueEntry>, QueueError> {
        let mut conn = self.connection().await?;
        self.promote_stale(&mut conn).await?;

        let popped: Vec<(String, f64)> = conn
            .zpopmin(QUEUE_KEY, 1)
            .await
            .map_err(QueueError::Redis)?;
        match popped.into_iter().next() {
            Some((member, _)) => {
                let entry: QueueEntry = serde_json::from_str(&member)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn requeue(&self, mut entry: QueueEntry) -> Result<(), QueueError> {
        entry.requeued_at = Some(Utc::now());
        self.push(entry).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.connection().await?;

        let (queued_high, oldest_high) = self.tier_stats(&mut conn, Priority::High).await?;
        let (queued_default, oldest_default) =
            self.tier_stats(&mut conn, Priority::Default).await?;
        let (queued_low, oldest_low) = self.tier_stats(&mut conn, Priority::Low).await?;

        let active_workers: Option<i64> = conn
            .get(ACTIVE_WORKERS_KEY)
            .await
            .map_err(QueueError::Redis)?;

        let now_millis = Utc::now().timestamp_millis();
        let oldest_queued_age_seconds = [oldest_high, oldest_default, oldest_low]
            .into_iter()
            .flatten()
            .map(|millis| ((now_millis - millis).max(0) / 1000) as u64)
            .max();

        Ok(QueueStats {
            queued_high,
            queued_default,
            queued_low,
            active_workers: active_workers.unwrap_or(0).max(0) as u64,
            oldest_queued_age_seconds,
        })
    }

    async fn add_active_workers(&self, delta: i64) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.incr::<_, _, ()>(ACTIVE_WORKERS_KEY, delta)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}
