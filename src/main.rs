use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use songscreen::app_state::AppState;
use songscreen::config::AppConfig;
use songscreen::db;
use songscreen::queue::RedisQueue;
use songscreen::routes;
use songscreen::store::{JobStore, PostgresJobStore};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing songscreen API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "job_processing_seconds",
        "Time to process an analysis job end to end"
    );
    metrics::describe_counter!(
        "analysis_jobs_submitted_total",
        "Total analysis jobs submitted"
    );
    metrics::describe_counter!(
        "analysis_jobs_completed_total",
        "Total analysis jobs that reached a terminal state other than failed"
    );
    metrics::describe_counter!(
        "analysis_jobs_failed_total",
        "Total analysis jobs that failed"
    );
    metrics::describe_gauge!(
        "analysis_queue_depth",
        "Current number of queued jobs across all priority tiers"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    // Read-mostly pool: status polls plus occasional submissions and the
    // retention sweep.
    let db_pool = db::init_pool(&config.database_url, 8)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize job store and queue broker
    let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(db_pool.clone()));

    tracing::info!("Connecting to Redis queue broker");
    let queue = Arc::new(
        RedisQueue::new(&config.redis_url, config.promotion_threshold())
            .expect("Failed to initialize job queue"),
    );

    // Create shared application state
    let state = AppState::new(db_pool, store.clone(), queue, config.max_retries);

    // Periodic retention sweep: terminal jobs expire out of the store,
    // making their ids 404 and their fingerprints free forever.
    {
        let store = store.clone();
        let retention = config.job_retention();
        let interval = config.eviction_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match store.evict_expired(retention).await {
                    Ok(0) => {}
                    Ok(evicted) => tracing::info!(evicted, "Evicted expired jobs"),
                    Err(e) => tracing::error!(error = %e, "Retention sweep failed"),
                }
            }
        });
    }

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/jobs", post(routes::jobs::submit_job))
        .route("/jobs/{job_id}", get(routes::jobs::job_status))
        .route("/jobs/{job_id}/cancel", post(routes::jobs::cancel_job))
        .route("/queue/stats", get(routes::queue::queue_stats))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024)); // 2 MB limit

    tracing::info!("Starting songscreen on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
