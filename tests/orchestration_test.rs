//! End-to-end orchestration tests over the in-memory backends: submit,
//! dequeue, execute with a mock analyzer, finalize, observe status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use songscreen::models::job::{
    AnalysisVerdict, ErrorKind, ItemOutcome, Job, JobKind, JobResult, JobStatus,
    OverrideDecision, Priority, TrackRef, VerdictSource,
};
use songscreen::queue::{JobQueue, MemoryQueue, QueueEntry};
use songscreen::services::analyzer::{Analyzer, AnalyzerError};
use songscreen::services::overrides::MemoryOverrideStore;
use songscreen::services::sink::MemoryResultSink;
use songscreen::store::{JobStore, MemoryJobStore, StoreError};
use songscreen::worker::{process_one, WorkerConfig, WorkerContext};

/// Analyzer double: counts calls, optionally sleeps per item, and fails
/// transiently a scripted number of times per track.
#[derive(Default)]
struct MockAnalyzer {
    calls: AtomicU32,
    latency: Option<Duration>,
    always_timeout: bool,
    transient_failures: Mutex<HashMap<String, u32>>,
}

impl MockAnalyzer {
    fn with_latency(latency: Duration) -> Self {
        Self { latency: Some(latency), ..Self::default() }
    }

    fn always_timeout() -> Self {
        Self { always_timeout: true, ..Self::default() }
    }

    fn fail_transiently(self, track_id: &str, times: u32) -> Self {
        self.transient_failures.lock().unwrap().insert(track_id.to_string(), times);
        self
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn analyze(
        &self,
        track: &TrackRef,
        _timeout: Duration,
    ) -> Result<AnalysisVerdict, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.always_timeout {
            return Err(AnalyzerError::Transient("analyzer call timed out".into()));
        }
        {
            let mut failures = self.transient_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&track.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(AnalyzerError::Transient("analyzer call timed out".into()));
                }
            }
        }
        Ok(AnalysisVerdict {
            flagged: false,
            categories: vec![],
            confidence: 0.9,
            source: VerdictSource::Analyzer,
        })
    }
}

struct Harness {
    ctx: WorkerContext,
    store: Arc<MemoryJobStore>,
    queue: Arc<MemoryQueue>,
    analyzer: Arc<MockAnalyzer>,
    overrides: Arc<MemoryOverrideStore>,
    sink: Arc<MemoryResultSink>,
}

fn harness(analyzer: MockAnalyzer) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(600)));
    let analyzer = Arc::new(analyzer);
    let overrides = Arc::new(MemoryOverrideStore::new());
    let sink = Arc::new(MemoryResultSink::new());
    let ctx = WorkerContext {
        store: store.clone(),
        queue: queue.clone(),
        analyzer: analyzer.clone(),
        overrides: overrides.clone(),
        sink: sink.clone(),
        config: WorkerConfig {
            item_timeout: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(1),
            idle_sleep: Duration::from_millis(1),
        },
    };
    Harness { ctx, store, queue, analyzer, overrides, sink }
}

fn track(id: &str) -> TrackRef {
    TrackRef { id: id.into(), label: format!("Artist - {id}") }
}

fn playlist_job(fingerprint: &str, ids: &[&str], max_retries: u32) -> Job {
    Job::new(
        JobKind::Playlist { tracks: ids.iter().map(|id| track(id)).collect() },
        Priority::Default,
        fingerprint.into(),
        max_retries,
        None,
    )
}

fn track_job(fingerprint: &str, id: &str, max_retries: u32) -> Job {
    Job::new(
        JobKind::Track { track: track(id) },
        Priority::Default,
        fingerprint.into(),
        max_retries,
        None,
    )
}

/// Mirror of the submission handler: create then enqueue.
async fn submit(h: &Harness, job: Job) -> Uuid {
    let priority = job.priority;
    let id = h.store.create(job).await.unwrap();
    h.queue.push(QueueEntry::new(id, priority)).await.unwrap();
    id
}

#[tokio::test]
async fn concurrent_submissions_for_one_fingerprint_share_a_job() {
    let h = harness(MockAnalyzer::default());
    let store = h.store.clone();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store.create(track_job("fp-shared", &format!("t{i}"), 3)).await
            })
        })
        .collect();

    let mut created = vec![];
    let mut reused = vec![];
    for task in tasks {
        match task.await.unwrap() {
            Ok(id) => created.push(id),
            Err(StoreError::DuplicateTarget { existing, .. }) => reused.push(existing),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(created.len(), 1, "exactly one job may be created per fingerprint");
    assert_eq!(reused.len(), 7);
    assert!(reused.iter().all(|id| *id == created[0]));
    assert_eq!(store.in_flight_job("fp-shared").await.unwrap(), Some(created[0]));
}

#[tokio::test]
async fn all_override_batch_completes_without_analyzer_calls() {
    let h = harness(MockAnalyzer::default());
    h.overrides.deny("a");
    h.overrides.allow("b");
    h.overrides.deny("c");

    let id = submit(&h, playlist_job("fp-batch", &["a", "b", "c"], 3)).await;
    assert!(process_one(&h.ctx).await.unwrap());

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(h.analyzer.call_count(), 0);

    match job.result.unwrap() {
        JobResult::Playlist(summary) => {
            assert_eq!(summary.succeeded, 3);
            assert!(summary
                .outcomes
                .iter()
                .all(|o| matches!(o, ItemOutcome::Overridden { .. })));
        }
        other => panic!("expected playlist result, got {other:?}"),
    }
    // Overrides bypass persistence as well as analysis.
    assert!(h.sink.persisted().is_empty());
}

#[tokio::test]
async fn high_priority_job_processed_before_earlier_low_submission() {
    let h = harness(MockAnalyzer::default());

    let mut low = track_job("fp-low", "low-track", 3);
    low.priority = Priority::Low;
    let mut high = track_job("fp-high", "high-track", 3);
    high.priority = Priority::High;

    let low_id = submit(&h, low).await;
    let high_id = submit(&h, high).await;

    assert!(process_one(&h.ctx).await.unwrap());
    let high_job = h.store.get(high_id).await.unwrap().unwrap();
    let low_job = h.store.get(low_id).await.unwrap().unwrap();
    assert_eq!(high_job.status, JobStatus::Finished);
    assert_eq!(low_job.status, JobStatus::Queued);

    assert!(process_one(&h.ctx).await.unwrap());
    let low_job = h.store.get(low_id).await.unwrap().unwrap();
    assert_eq!(low_job.status, JobStatus::Finished);
}

#[tokio::test]
async fn progress_and_eta_are_observable_and_monotonic() {
    let h = harness(MockAnalyzer::with_latency(Duration::from_millis(30)));
    let id = submit(&h, playlist_job("fp-eta", &["a", "b", "c", "d", "e"], 3)).await;

    let runner = {
        let ctx = h.ctx.clone();
        tokio::spawn(async move { process_one(&ctx).await.unwrap() })
    };

    let mut snapshots = vec![];
    loop {
        if let Some(job) = h.store.get(id).await.unwrap() {
            snapshots.push(job.progress.clone());
            if job.status.is_terminal() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(runner.await.unwrap());

    // completed_items never regresses.
    let completed: Vec<u32> = snapshots.iter().map(|p| p.completed_items).collect();
    assert!(completed.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {completed:?}");

    // ETA is unknown before the first sample, then a positive estimate.
    for progress in &snapshots {
        match progress.completed_items {
            0 => assert_eq!(progress.eta_seconds, None),
            n if n < progress.total_items => {
                if let Some(eta) = progress.eta_seconds {
                    assert!(eta > 0.0);
                }
            }
            _ => {}
        }
    }
    assert!(
        snapshots
            .iter()
            .any(|p| p.completed_items > 0 && p.completed_items < p.total_items
                && p.eta_seconds.is_some()),
        "no mid-flight snapshot carried an ETA"
    );
}

#[tokio::test]
async fn cancelling_a_running_batch_stops_at_item_boundary() {
    let h = harness(MockAnalyzer::with_latency(Duration::from_millis(25)));
    let ids: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let id = submit(&h, playlist_job("fp-cancel", &id_refs, 3)).await;

    let runner = {
        let ctx = h.ctx.clone();
        tokio::spawn(async move { process_one(&ctx).await.unwrap() })
    };

    // Wait until a couple of items completed, then cancel.
    loop {
        let job = h.store.get(id).await.unwrap().unwrap();
        if job.progress.completed_items >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.store.request_cancel(id).await.unwrap();
    assert!(runner.await.unwrap());

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.finished_at.is_some());
    assert!(job.progress.completed_items < 10, "cancellation should stop the batch early");

    // Partial outcomes are retained.
    match job.result.unwrap() {
        JobResult::Playlist(summary) => {
            assert_eq!(summary.outcomes.len() as u32, job.progress.completed_items);
            assert_eq!(summary.failed, 0);
        }
        other => panic!("expected playlist result, got {other:?}"),
    }
    // Fingerprint freed for resubmission.
    assert_eq!(h.store.in_flight_job("fp-cancel").await.unwrap(), None);
}

#[tokio::test]
async fn batch_with_denied_item_and_flaky_item_finishes() {
    let analyzer = MockAnalyzer::default().fail_transiently("c", 2);
    let h = harness(analyzer);
    h.overrides.deny("b");

    let id = submit(&h, playlist_job("fp-abc", &["a", "b", "c"], 3)).await;
    assert!(process_one(&h.ctx).await.unwrap());

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    assert_eq!(job.retry_count, 2, "two transient failures on c");

    match job.result.unwrap() {
        JobResult::Playlist(summary) => {
            assert_eq!(summary.succeeded, 3);
            assert_eq!(summary.failed, 0);
            match &summary.outcomes[..] {
                [ItemOutcome::Analyzed { track_id: a, .. }, ItemOutcome::Overridden { track_id: b, decision }, ItemOutcome::Analyzed { track_id: c, .. }] =>
                {
                    assert_eq!(a, "a");
                    assert_eq!(b, "b");
                    assert_eq!(*decision, OverrideDecision::ForceDeny);
                    assert_eq!(c, "c");
                }
                other => panic!("unexpected outcomes: {other:?}"),
            }
        }
        other => panic!("expected playlist result, got {other:?}"),
    }

    // a and c persisted; the overridden b never reached the sink.
    let persisted: Vec<String> = h.sink.persisted().into_iter().map(|(id, _)| id).collect();
    assert_eq!(persisted, vec!["a".to_string(), "c".to_string()]);
}

#[tokio::test]
async fn retry_exhaustion_fails_single_job_with_transient_kind() {
    let h = harness(MockAnalyzer::always_timeout());
    let id = submit(&h, track_job("fp-timeout", "t1", 2)).await;

    assert!(process_one(&h.ctx).await.unwrap());

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::TransientAnalyzer);
    // 1 initial attempt + 2 retries.
    assert_eq!(h.analyzer.call_count(), 3);
    assert_eq!(h.store.in_flight_job("fp-timeout").await.unwrap(), None);
}

#[tokio::test]
async fn persistence_failure_retries_without_reanalyzing() {
    let h = harness(MockAnalyzer::default());
    h.sink.fail_next(2);

    let id = submit(&h, track_job("fp-sink", "t1", 3)).await;
    assert!(process_one(&h.ctx).await.unwrap());

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    // The analyzer ran once; only the sink was retried.
    assert_eq!(h.analyzer.call_count(), 1);
    assert_eq!(job.retry_count, 2);
    assert_eq!(h.sink.persisted().len(), 1);
}

#[tokio::test]
async fn exhausted_persistence_marks_job_failed_with_persistence_kind() {
    let h = harness(MockAnalyzer::default());
    h.sink.fail_next(10);

    let id = submit(&h, track_job("fp-sink-dead", "t1", 2)).await;
    assert!(process_one(&h.ctx).await.unwrap());

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::Persistence);
    assert_eq!(h.analyzer.call_count(), 1, "persistence retries must not re-run analysis");
}

#[tokio::test]
async fn partial_batch_failure_still_finishes_with_aggregate() {
    // "b" exhausts its retries; the batch carries on.
    let analyzer = MockAnalyzer::default().fail_transiently("b", 10);
    let h = harness(analyzer);

    let id = submit(&h, playlist_job("fp-partial", &["a", "b", "c"], 1)).await;
    assert!(process_one(&h.ctx).await.unwrap());

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Finished);
    match job.result.unwrap() {
        JobResult::Playlist(summary) => {
            assert_eq!(summary.succeeded, 2);
            assert_eq!(summary.failed, 1);
            assert!(matches!(
                &summary.outcomes[1],
                ItemOutcome::Failed { error, .. } if error.kind == ErrorKind::TransientAnalyzer
            ));
        }
        other => panic!("expected playlist result, got {other:?}"),
    }
}

#[tokio::test]
async fn batch_where_every_item_fails_is_a_failed_job() {
    let h = harness(MockAnalyzer::always_timeout());
    let id = submit(&h, playlist_job("fp-allfail", &["a", "b"], 0)).await;

    assert!(process_one(&h.ctx).await.unwrap());

    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::TransientAnalyzer);
}

#[tokio::test]
async fn queued_job_cancelled_before_claim_never_runs() {
    let h = harness(MockAnalyzer::default());
    let id = submit(&h, track_job("fp-precancel", "t1", 3)).await;

    h.store.request_cancel(id).await.unwrap();

    // The worker pops the stale entry and drops it without executing.
    assert!(process_one(&h.ctx).await.unwrap());
    let job = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(h.analyzer.call_count(), 0);
    assert!(job.started_at.is_none());
}
