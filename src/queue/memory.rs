use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::queue::{JobQueue, QueueEntry, QueueError, QueueStats};

/// In-process priority queue for tests and single-process deployments.
/// BTreeMap keys give (tier, enqueue time) ordering for free; consumers
/// poll with an idle sleep, same as against the Redis broker.
pub struct MemoryQueue {
    entries: Mutex<BTreeMap<OrderKey, QueueEntry>>,
    active_workers: AtomicI64,
    promotion_threshold: Duration,
}

/// (priority rank, enqueue millis, job id) — job id breaks exact ties.
type OrderKey = (u8, i64, Uuid);

fn order_key(entry: &QueueEntry) -> OrderKey {
    (entry.priority.rank(), entry.enqueued_at.timestamp_millis(), entry.job_id)
}

impl MemoryQueue {
    pub fn new(promotion_threshold: Duration) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            active_workers: AtomicI64::new(0),
            promotion_threshold,
        }
    }

    /// Bump entries stale past the threshold one tier. Runs under the
    /// entries lock, before each pop.
    fn promote_stale(entries: &mut BTreeMap<OrderKey, QueueEntry>, threshold: Duration) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let stale: Vec<OrderKey> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.priority.rank() > 0 && entry.promotion_basis() < cutoff
            })
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            if let Some(mut entry) = entries.remove(&key) {
                entry.priority = entry.priority.promoted();
                entry.requeued_at = Some(Utc::now());
                entries.insert(order_key(&entry), entry);
            }
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn push(&self, entry: QueueEntry) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(order_key(&entry), entry);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<QueueEntry>, QueueError> {
        let mut entries = self.entries.lock().unwrap();
        Self::promote_stale(&mut entries, self.promotion_threshold);
        let first = entries.keys().next().copied();
        Ok(first.and_then(|key| entries.remove(&key)))
    }

    async fn requeue(&self, mut entry: QueueEntry) -> Result<(), QueueError> {
        entry.requeued_at = Some(Utc::now());
        self.push(entry).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let entries = self.entries.lock().unwrap();
        let mut stats = QueueStats {
            active_workers: self.active_workers.load(Ordering::Relaxed).max(0) as u64,
            ..QueueStats::default()
        };
        for entry in entries.values() {
            match entry.priority.rank() {
                0 => stats.queued_high += 1,
                1 => stats.queued_default += 1,
                _ => stats.queued_low += 1,
            }
        }
        stats.oldest_queued_age_seconds = entries
            .values()
            .map(|entry| entry.enqueued_at)
            .min()
            .map(|oldest| (Utc::now() - oldest).num_seconds().max(0) as u64);
        Ok(stats)
    }

    async fn add_active_workers(&self, delta: i64) -> Result<(), QueueError> {
        self.active_workers.fetch_add(delta, Ordering::Relaxed);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
