use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use songscreen::config::AppConfig;
use songscreen::db;
use songscreen::queue::RedisQueue;
use songscreen::services::analyzer::LlmAnalyzerClient;
use songscreen::services::overrides::RedisOverrideStore;
use songscreen::services::sink::PostgresResultSink;
use songscreen::store::PostgresJobStore;
use songscreen::worker::{spawn_pool, WorkerConfig, WorkerContext};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting songscreen analysis worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database: one connection per worker plus headroom for
    // verdict persistence overlapping job-state writes
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.worker_count as u32 + 2)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let store = Arc::new(PostgresJobStore::new(db_pool.clone()));

    let queue = Arc::new(
        RedisQueue::new(&config.redis_url, config.promotion_threshold())
            .expect("Failed to initialize job queue"),
    );

    let analyzer = Arc::new(LlmAnalyzerClient::new(
        &config.analyzer_url,
        &config.analyzer_token,
    ));

    let overrides = Arc::new(
        RedisOverrideStore::new(&config.redis_url)
            .expect("Failed to initialize override store"),
    );

    let sink = Arc::new(PostgresResultSink::new(db_pool));

    let ctx = WorkerContext {
        store,
        queue,
        analyzer,
        overrides,
        sink,
        config: WorkerConfig {
            item_timeout: config.item_timeout(),
            retry_backoff: config.retry_backoff(),
            idle_sleep: config.dequeue_idle(),
        },
    };

    tracing::info!(worker_count = config.worker_count, "Spawning worker pool");
    let handles = spawn_pool(ctx, config.worker_count);

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task exited");
        }
    }
}
