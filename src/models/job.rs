use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of an analysis job in the async queue.
///
/// Transitions are monotonic: `Queued → Running → {Finished, Failed,
/// Cancelled}`, plus `Queued → Cancelled` for jobs cancelled before a
/// worker claims them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Whether `self → next` is a valid state-machine edge.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Finished)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

/// Scheduling tier. Lower rank dequeues first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    High,
    Default,
    Low,
}

impl Priority {
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Default => 1,
            Priority::Low => 2,
        }
    }

    /// One tier up, saturating at `High`. Used for starvation promotion.
    pub fn promoted(&self) -> Priority {
        match self {
            Priority::High | Priority::Default => Priority::High,
            Priority::Low => Priority::Default,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Default
    }
}

/// Reference to a single track to be analyzed.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct TrackRef {
    /// Stable track identity (catalog id), used for override lookups and
    /// result persistence.
    #[garde(length(min = 1, max = 256))]
    pub id: String,

    /// Human-readable display string, e.g. "Artist - Title".
    #[garde(length(min = 1, max = 512))]
    pub label: String,
}

/// What kind of work a job carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Analyze one track.
    Track { track: TrackRef },
    /// Analyze every track of a playlist, in stored order.
    Playlist { tracks: Vec<TrackRef> },
}

impl JobKind {
    pub fn items(&self) -> &[TrackRef] {
        match self {
            JobKind::Track { track } => std::slice::from_ref(track),
            JobKind::Playlist { tracks } => tracks,
        }
    }

    pub fn total_items(&self) -> u32 {
        self.items().len() as u32
    }
}

/// Fine-grained progress of a running job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    pub completed_items: u32,
    pub total_items: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item_label: Option<String>,
    /// Moving-average estimate; `None` until the first item completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
}

impl JobProgress {
    pub fn new(total_items: u32) -> Self {
        Self {
            completed_items: 0,
            total_items,
            current_item_label: None,
            eta_seconds: None,
        }
    }

    pub fn percent(&self) -> Option<f64> {
        if self.total_items == 0 {
            return None;
        }
        Some(self.completed_items as f64 * 100.0 / self.total_items as f64)
    }
}

/// Machine-readable error classification surfaced to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    DuplicateTarget,
    TransientAnalyzer,
    PermanentAnalyzer,
    Persistence,
    InvalidTransition,
    NotFound,
    Internal,
}

/// Structured error stored on a failed job and echoed by the status API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Where an analysis verdict came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// Produced by the external analyzer.
    Analyzer,
    /// Synthesized from a user allow/deny override, no analyzer call.
    Override,
}

/// Result of analyzing one track's content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisVerdict {
    pub flagged: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub categories: Vec<String>,
    pub confidence: f64,
    pub source: VerdictSource,
}

/// User override decision from the allow/deny lists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverrideDecision {
    ForceApprove,
    ForceDeny,
}

impl OverrideDecision {
    /// Synthetic verdict standing in for an analyzer call.
    pub fn as_verdict(&self) -> AnalysisVerdict {
        AnalysisVerdict {
            flagged: matches!(self, OverrideDecision::ForceDeny),
            categories: vec!["user_override".to_string()],
            confidence: 1.0,
            source: VerdictSource::Override,
        }
    }
}

/// Outcome of one item within a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Analyzed { track_id: String, verdict: AnalysisVerdict },
    Overridden { track_id: String, decision: OverrideDecision },
    Failed { track_id: String, error: JobErrorInfo },
}

impl ItemOutcome {
    pub fn track_id(&self) -> &str {
        match self {
            ItemOutcome::Analyzed { track_id, .. }
            | ItemOutcome::Overridden { track_id, .. }
            | ItemOutcome::Failed { track_id, .. } => track_id,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ItemOutcome::Failed { .. })
    }
}

/// Aggregate result of a playlist job. Written once, at finalize.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSummary {
    pub succeeded: u32,
    pub failed: u32,
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: Vec<ItemOutcome>) -> Self {
        let failed = outcomes.iter().filter(|o| o.is_failure()).count() as u32;
        let succeeded = outcomes.len() as u32 - failed;
        Self { succeeded, failed, outcomes }
    }
}

/// Final result of a job, present once terminal. A cancelled playlist
/// retains the outcomes of items completed before the stop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JobResult {
    Track(ItemOutcome),
    Playlist(BatchSummary),
}

/// An analysis job as held in the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: JobKind,
    pub priority: Priority,
    /// Stable identity of the analysis target; one non-terminal job per
    /// fingerprint at a time.
    pub target_fingerprint: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub result: Option<JobResult>,
    pub error: Option<JobErrorInfo>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Opaque caller identity; not interpreted by the orchestration core.
    pub owner_context: Option<String>,
    pub cancel_requested: bool,
}

impl Job {
    pub fn new(
        kind: JobKind,
        priority: Priority,
        target_fingerprint: String,
        max_retries: u32,
        owner_context: Option<String>,
    ) -> Self {
        let total = kind.total_items();
        Self {
            id: Uuid::new_v4(),
            kind,
            priority,
            target_fingerprint,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            progress: JobProgress::new(total),
            result: None,
            error: None,
            retry_count: 0,
            max_retries,
            owner_context,
            cancel_requested: false,
        }
    }
}
