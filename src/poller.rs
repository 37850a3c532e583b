use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use uuid::Uuid;

use crate::models::api::JobStatusResponse;

/// Tuning for the client-side polling schedule.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Interval while a job is young or barely started.
    pub fast_interval: Duration,
    /// Interval through the bulk of a job.
    pub medium_interval: Duration,
    /// Interval near completion and for background jobs.
    pub slow_interval: Duration,
    /// Every job polls fast for this long after submission.
    pub fast_window: Duration,
    /// Ceiling for transport-error backoff.
    pub max_backoff: Duration,
    /// Consecutive transport failures tolerated before giving up.
    pub max_transport_failures: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(1),
            medium_interval: Duration::from_millis(2500),
            slow_interval: Duration::from_secs(5),
            fast_window: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
            max_transport_failures: 5,
        }
    }
}

/// How a polling session ended. Emitted exactly once.
#[derive(Debug)]
pub enum PollOutcome {
    /// The job reached a terminal status.
    Completed(JobStatusResponse),
    /// Transport kept failing; the job may still be running server-side.
    LostContact { attempts: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Unknown or expired job id: terminal for the poller.
    #[error("job not found")]
    NotFound,

    /// Network-level failure; retried with backoff.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Read side of the status API, abstracted for tests.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn status(&self, job_id: Uuid) -> Result<JobStatusResponse, PollError>;
}

/// HTTP client for GET /jobs/{id}.
pub struct HttpStatusSource {
    http: reqwest::Client,
    base_url: String,
}

impl HttpStatusSource {
    pub fn new(base_url: &str) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn status(&self, job_id: Uuid) -> Result<JobStatusResponse, PollError> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PollError::NotFound);
        }
        if !response.status().is_success() {
            return Err(PollError::Transport(format!("status endpoint returned {}", response.status())));
        }
        response
            .json::<JobStatusResponse>()
            .await
            .map_err(|e| PollError::Transport(e.to_string()))
    }
}

/// Pick the next poll delay from job age, progress, and scheduling class.
///
/// Fast while the job is young or barely moving (a queued job reports no
/// progress), medium through the middle, slow near the end and for
/// background work.
pub fn next_delay(
    config: &PollerConfig,
    elapsed: Duration,
    progress_percent: Option<f64>,
    background: bool,
) -> Duration {
    if background {
        return config.slow_interval;
    }
    let percent = progress_percent.unwrap_or(0.0);
    if elapsed < config.fast_window || percent < 10.0 {
        config.fast_interval
    } else if percent <= 90.0 {
        config.medium_interval
    } else {
        config.slow_interval
    }
}

/// Client-side polling driver for one job.
pub struct AdaptivePoller<S> {
    source: S,
    config: PollerConfig,
    /// Marks the job as low-priority/background, pinning the slow interval.
    background: bool,
}

impl<S: StatusSource> AdaptivePoller<S> {
    pub fn new(source: S, config: PollerConfig) -> Self {
        Self { source, config, background: false }
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Poll until the job is terminal or contact is lost. A terminal
    /// status (including NotFound for an evicted job) ends the session;
    /// transport errors back off exponentially from the current interval.
    pub async fn poll(&self, job_id: Uuid) -> Result<PollOutcome, PollError> {
        let started = tokio::time::Instant::now();
        let mut consecutive_failures = 0u32;
        let mut backoff: Option<Duration> = None;

        loop {
            match self.source.status(job_id).await {
                Ok(response) => {
                    if response.status.is_terminal() {
                        return Ok(PollOutcome::Completed(response));
                    }
                    consecutive_failures = 0;
                    backoff = None;
                    let delay = next_delay(
                        &self.config,
                        started.elapsed(),
                        response.progress.percent(),
                        self.background,
                    );
                    sleep(delay).await;
                }
                Err(PollError::NotFound) => return Err(PollError::NotFound),
                Err(PollError::Transport(message)) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.max_transport_failures {
                        tracing::warn!(
                            job_id = %job_id,
                            attempts = consecutive_failures,
                            error = %message,
                            "Giving up on status polling"
                        );
                        return Ok(PollOutcome::LostContact { attempts: consecutive_failures });
                    }
                    let current = backoff.unwrap_or_else(|| {
                        next_delay(&self.config, started.elapsed(), None, self.background)
                    });
                    let doubled = current.saturating_mul(2).min(self.config.max_backoff);
                    backoff = Some(doubled);
                    tracing::debug!(
                        job_id = %job_id,
                        attempt = consecutive_failures,
                        backoff_ms = doubled.as_millis() as u64,
                        "Transport error while polling, backing off"
                    );
                    sleep(doubled).await;
                }
            }
        }
    }
}
