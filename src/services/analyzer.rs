use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::models::job::{AnalysisVerdict, TrackRef, VerdictSource};

/// External content analysis function. Implementations must honor the
/// caller-supplied timeout and be safe to invoke repeatedly for the same
/// track (retries re-run the call).
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        track: &TrackRef,
        timeout: Duration,
    ) -> Result<AnalysisVerdict, AnalyzerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    /// Timeout, connection failure, throttling: retried with backoff.
    #[error("transient analyzer failure: {0}")]
    Transient(String),

    /// The analyzer explicitly rejected the input; never retried.
    #[error("analyzer rejected input: {0}")]
    Permanent(String),
}

/// Client for an LLM-backed content analysis endpoint.
pub struct LlmAnalyzerClient {
    http: Client,
    endpoint: String,
    api_token: String,
}

#[derive(Deserialize)]
struct LlmResponse {
    result: LlmResult,
}

#[derive(Deserialize)]
struct LlmResult {
    response: String,
}

#[derive(Deserialize)]
struct RawVerdict {
    flagged: bool,
    #[serde(default)]
    categories: Vec<String>,
    confidence: f64,
}

impl LlmAnalyzerClient {
    pub fn new(endpoint: &str, api_token: &str) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.to_string(),
            api_token: api_token.to_string(),
        }
    }
}

#[async_trait]
impl Analyzer for LlmAnalyzerClient {
    /// Ask the model to classify a track's content and return a
    /// structured verdict.
    async fn analyze(
        &self,
        track: &TrackRef,
        timeout: Duration,
    ) -> Result<AnalysisVerdict, AnalyzerError> {
        let prompt = format!(
            concat!(
                "Analyze the song \"{}\" (id {}) for content requiring review. ",
                "Return ONLY valid JSON with these exact fields: ",
                "flagged (boolean), categories (array of strings), ",
                "confidence (number between 0 and 1)."
            ),
            track.label, track.id
        );

        let request_body = serde_json::json!({
            "prompt": prompt,
            "max_tokens": 256
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .timeout(timeout)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    AnalyzerError::Transient(e.to_string())
                } else {
                    AnalyzerError::Permanent(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(AnalyzerError::Transient(format!("analyzer returned {status}")));
        }
        if !status.is_success() {
            return Err(AnalyzerError::Permanent(format!("analyzer returned {status}")));
        }

        let llm_resp: LlmResponse = response
            .json()
            .await
            .map_err(|e| AnalyzerError::Transient(e.to_string()))?;
        let raw: RawVerdict = serde_json::from_str(&llm_resp.result.response)
            .map_err(|e| AnalyzerError::Permanent(format!("unparseable verdict: {e}")))?;

        Ok(AnalysisVerdict {
            flagged: raw.flagged,
            categories: raw.categories,
            confidence: raw.confidence,
            source: VerdictSource::Analyzer,
        })
    }
}
