use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::models::job::OverrideDecision;

const ALLOW_KEY: &str = "songscreen:overrides:allow";
const DENY_KEY: &str = "songscreen:overrides:deny";

/// Short-circuit cache over user-owned allow/deny lists, consulted before
/// every analyzer call. Side-effect-free; the orchestration core never
/// mutates the underlying lists.
#[async_trait]
pub trait OverrideStore: Send + Sync {
    async fn lookup(&self, track_id: &str) -> Result<Option<OverrideDecision>, OverrideError>;
}

#[derive(Debug, thiserror::Error)]
pub enum OverrideError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Production lookup against Redis sets maintained by the override UI.
/// Deny takes precedence when a track somehow appears on both lists.
pub struct RedisOverrideStore {
    client: redis::Client,
}

impl RedisOverrideStore {
    pub fn new(redis_url: &str) -> Result<Self, OverrideError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OverrideStore for RedisOverrideStore {
    async fn lookup(&self, track_id: &str) -> Result<Option<OverrideDecision>, OverrideError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let denied: bool = conn.sismember(DENY_KEY, track_id).await?;
        if denied {
            return Ok(Some(OverrideDecision::ForceDeny));
        }
        let allowed: bool = conn.sismember(ALLOW_KEY, track_id).await?;
        if allowed {
            return Ok(Some(OverrideDecision::ForceApprove));
        }
        Ok(None)
    }
}

/// In-memory override lists for tests.
#[derive(Default)]
pub struct MemoryOverrideStore {
    allow: RwLock<HashSet<String>>,
    deny: RwLock<HashSet<String>>,
}

impl MemoryOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, track_id: &str) {
        self.allow.write().unwrap().insert(track_id.to_string());
    }

    pub fn deny(&self, track_id: &str) {
        self.deny.write().unwrap().insert(track_id.to_string());
    }
}

#[async_trait]
impl OverrideStore for MemoryOverrideStore {
    async fn lookup(&self, track_id: &str) -> Result<Option<OverrideDecision>, OverrideError> {
        if self.deny.read().unwrap().contains(track_id) {
            return Ok(Some(OverrideDecision::ForceDeny));
        }
        if self.allow.read().unwrap().contains(track_id) {
            return Ok(Some(OverrideDecision::ForceApprove));
        }
        Ok(None)
    }
}
