use sqlx::PgPool;
use std::sync::Arc;

use crate::queue::JobQueue;
use crate::store::JobStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    /// Retry budget stamped onto newly created jobs.
    pub max_retries: u32,
}

impl AppState {
    pub fn new(
        db: PgPool,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        max_retries: u32,
    ) -> Self {
        Self { db, store, queue, max_retries }
    }
}
