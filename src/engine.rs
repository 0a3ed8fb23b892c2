//! Sequential Import Engine
//!
//! Single-flight job runner over the job list. Whenever the engine is idle it
//! scans for the first `Pending` job in list order and runs it through
//! download and upload. Failures stay on the job; the scan simply moves on.
//!
//! Progress contract:
//! - download: `round(received * 50 / total)`, held below 50 until the body
//!   is complete; unknown totals stay at the minimum
//! - upload: `50 + round(sent * 50 / total)`, capped at 100

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::host::{AssetUpload, HostApi};
use crate::jobs::{ImportJob, ImportSummary, JobPhase, JobStore, DOWNLOAD_FAILED, UPLOAD_FAILED};
use crate::providers::{ProviderError, RemoteFileSource, TokenSource};

/// Download progress in percent of the whole job, or `None` when the total
/// size is unknown.
pub fn download_progress(received: u64, total: Option<u64>) -> Option<u8> {
    let total = total.filter(|t| *t > 0)?;
    let percent = (received as f64 * 50.0 / total as f64).round();
    Some(percent.clamp(0.0, 49.0) as u8)
}

/// Upload progress in percent of the whole job
pub fn upload_progress(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = 50.0 + (sent as f64 * 50.0 / total as f64).round();
    percent.clamp(50.0, 100.0) as u8
}

pub struct SequentialImportEngine {
    store: JobStore,
    source: Arc<dyn RemoteFileSource>,
    tokens: Arc<dyn TokenSource>,
    host: Arc<dyn HostApi>,
    collection_id: u64,
    busy: AtomicBool,
    shutdown: CancellationToken,
}

impl SequentialImportEngine {
    pub fn new(
        store: JobStore,
        source: Arc<dyn RemoteFileSource>,
        tokens: Arc<dyn TokenSource>,
        host: Arc<dyn HostApi>,
        collection_id: u64,
    ) -> Self {
        Self {
            store,
            source,
            tokens,
            host,
            collection_id,
            busy: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use an externally owned shutdown token
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Cancelling this token stops dispatch; a job already running completes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// First job, in list order, that has not been attempted yet
    pub fn next_pending(&self) -> Option<(usize, ImportJob)> {
        self.store
            .snapshot()
            .iter()
            .enumerate()
            .find(|(_, job)| job.phase == JobPhase::Pending)
            .map(|(index, job)| (index, job.clone()))
    }

    /// Run the next pending job to completion.
    ///
    /// Returns false without doing anything when the engine is busy, shut
    /// down, or has nothing left to run.
    pub async fn start_next(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let Some((index, job)) = self.next_pending() else {
            self.busy.store(false, Ordering::SeqCst);
            info!("No pending jobs; engine idle");
            return false;
        };

        self.run_job(index, job).await;
        self.busy.store(false, Ordering::SeqCst);
        true
    }

    /// Keep dispatching until no pending job is left or shutdown is requested
    pub async fn run(&self) -> ImportSummary {
        info!("Import run started with {} job(s)", self.store.len());
        while self.start_next().await {}

        if self.shutdown.is_cancelled() {
            warn!("Import run stopped before all jobs were dispatched");
        }
        let summary = ImportSummary::from_jobs(&self.store.snapshot());
        info!(
            finished = summary.finished,
            failed = summary.failed,
            flagged = summary.flagged,
            pending = summary.pending,
            "Import run complete"
        );
        summary
    }

    async fn run_job(&self, index: usize, job: ImportJob) {
        info!(job = index, remote_id = %job.remote_id, action = %job.action, "Starting import");
        self.store.update(index, |j| {
            j.phase = JobPhase::Downloading;
            j.progress = 0;
            j.error_message = None;
        });

        let bytes = match self.download(index, &job).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(job = index, remote_id = %job.remote_id, "Download failed: {}", e);
                self.store.update(index, |j| {
                    j.phase = JobPhase::Failed;
                    j.progress = 0;
                    j.error_message = Some(DOWNLOAD_FAILED.to_string());
                });
                return;
            }
        };

        self.store.update(index, |j| {
            j.phase = JobPhase::Uploading;
            j.progress = 50;
        });

        let upload = AssetUpload {
            remote_id: job.remote_id.clone(),
            target_asset_id: job.target_asset_id,
            action: job.action,
            name: job.name.clone(),
            collection_id: self.collection_id,
            bytes,
        };
        let store = &self.store;
        let on_progress = move |sent: u64, total: u64| {
            store.raise_progress(index, upload_progress(sent, total));
        };

        match self.host.create_asset(upload, &on_progress).await {
            Ok(response) => {
                let host_error = response.host_error().map(str::to_string);
                if let Some(ref message) = host_error {
                    warn!(job = index, remote_id = %job.remote_id, "Host reported: {}", message);
                } else {
                    info!(job = index, remote_id = %job.remote_id, "Imported");
                }
                self.store.update(index, |j| {
                    j.phase = JobPhase::Finished;
                    j.progress = 100;
                    j.error_message = host_error;
                    j.rendered_edit_form = response.form;
                    j.edit_endpoint = response.edit_action;
                    j.delete_endpoint = response.delete_action;
                });
            }
            Err(e) => {
                error!(job = index, remote_id = %job.remote_id, "Upload failed: {}", e);
                self.store.update(index, |j| {
                    j.phase = JobPhase::Failed;
                    j.error_message = Some(UPLOAD_FAILED.to_string());
                });
            }
        }
    }

    async fn download(&self, index: usize, job: &ImportJob) -> Result<Vec<u8>, ProviderError> {
        let token = self.tokens.access_token().await?;
        let store = &self.store;
        let on_progress = move |received: u64, total: Option<u64>| {
            if let Some(percent) = download_progress(received, total) {
                store.raise_progress(index, percent);
            }
        };
        self.source
            .fetch(&job.remote_id, job.resource_key.as_deref(), &token, &on_progress)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duplicates::ResolutionAction;
    use crate::host::HostResponse;
    use crate::jobs::aggregate_progress;
    use crate::testing::{created, ActiveProbe, CountingToken, EventLog, FakeHost, FakeSource};
    use tokio::sync::Notify;

    struct Harness {
        engine: Arc<SequentialImportEngine>,
        source: Arc<FakeSource>,
        host: Arc<FakeHost>,
        tokens: Arc<CountingToken>,
        log: EventLog,
        probe: ActiveProbe,
    }

    fn keep(id: &str) -> ImportJob {
        ImportJob::pending(id, format!("{}.png", id), ResolutionAction::Keep, None)
    }

    fn harness(
        jobs: Vec<ImportJob>,
        source: impl FnOnce(FakeSource) -> FakeSource,
        host: impl FnOnce(FakeHost) -> FakeHost,
    ) -> Harness {
        let log = EventLog::default();
        let probe = ActiveProbe::default();
        let store = JobStore::new(jobs);
        probe.attach(&store);

        let source = Arc::new(source(FakeSource::new(log.clone(), probe.clone())));
        let host = Arc::new(host(FakeHost::observed(log.clone(), probe.clone())));
        let tokens = Arc::new(CountingToken::default());
        let engine = Arc::new(SequentialImportEngine::new(
            store,
            source.clone(),
            tokens.clone(),
            host.clone(),
            3,
        ));
        Harness { engine, source, host, tokens, log, probe }
    }

    #[test]
    fn test_download_progress_rounding() {
        assert_eq!(download_progress(0, Some(100)), Some(0));
        assert_eq!(download_progress(33, Some(100)), Some(17)); // 16.5 rounds up
        assert_eq!(download_progress(99, Some(100)), Some(49));
        assert_eq!(download_progress(100, Some(100)), Some(49));
        assert_eq!(download_progress(10, None), None);
        assert_eq!(download_progress(10, Some(0)), None);
    }

    #[test]
    fn test_upload_progress_rounding() {
        assert_eq!(upload_progress(0, 200), 50);
        assert_eq!(upload_progress(100, 200), 75);
        assert_eq!(upload_progress(200, 200), 100);
        assert_eq!(upload_progress(500, 200), 100);
        assert_eq!(upload_progress(0, 0), 100);
    }

    #[tokio::test]
    async fn test_single_job_finishes() {
        let h = harness(vec![keep("a")], |s| s.serve("a", vec![1; 1000]), |h| h);
        let summary = h.engine.run().await;

        let jobs = h.engine.store().snapshot();
        assert_eq!(jobs[0].phase, JobPhase::Finished);
        assert_eq!(jobs[0].progress, 100);
        assert_eq!(jobs[0].error_message, None);
        assert_eq!(jobs[0].edit_endpoint.as_deref(), Some("/admin/image-import/edit/a/"));
        assert!(jobs[0].rendered_edit_form.is_some());
        assert_eq!(aggregate_progress(&jobs), Some(100));
        assert_eq!(summary.finished, 1);
        assert!(!h.engine.is_busy());
    }

    #[tokio::test]
    async fn test_upload_carries_job_metadata() {
        let job = ImportJob::pending("a", "photo.jpg", ResolutionAction::Replace, Some(42));
        let h = harness(vec![job], |s| s.serve("a", vec![0; 10]), |h| h);
        h.engine.run().await;

        let uploads = h.host.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].remote_id, "a");
        assert_eq!(uploads[0].target_asset_id, Some(42));
        assert_eq!(uploads[0].action, ResolutionAction::Replace);
        assert_eq!(uploads[0].name, "photo.jpg");
        assert_eq!(uploads[0].collection_id, 3);
        assert_eq!(uploads[0].size, 10);
    }

    #[tokio::test]
    async fn test_download_failure_moves_on() {
        let h = harness(vec![keep("a"), keep("b")], |s| s.fail("a").serve("b", vec![1; 8]), |h| h);
        let summary = h.engine.run().await;

        let jobs = h.engine.store().snapshot();
        assert_eq!(jobs[0].phase, JobPhase::Failed);
        assert_eq!(jobs[0].progress, 0);
        assert_eq!(jobs[0].error_message.as_deref(), Some(DOWNLOAD_FAILED));
        assert_eq!(jobs[1].phase, JobPhase::Finished);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.finished, 1);
        assert_eq!(aggregate_progress(&jobs), Some(100));
        // The failed job was not uploaded
        assert_eq!(h.log.events(), vec!["fetch:a", "fetch:b", "upload:b", "uploaded:b"]);
    }

    #[tokio::test]
    async fn test_upload_failure_sentinel() {
        let h = harness(
            vec![keep("a"), keep("b")],
            |s| s.serve("a", vec![1; 8]).serve("b", vec![1; 8]),
            |h| h.fail_upload("a"),
        );
        h.engine.run().await;

        let jobs = h.engine.store().snapshot();
        assert_eq!(jobs[0].phase, JobPhase::Failed);
        assert_eq!(jobs[0].error_message.as_deref(), Some(UPLOAD_FAILED));
        assert_eq!(jobs[1].phase, JobPhase::Finished);
    }

    #[tokio::test]
    async fn test_host_error_is_kept_on_finished_job() {
        let response = HostResponse {
            error: Some("title required".to_string()),
            ..created("a")
        };
        let h = harness(vec![keep("a")], |s| s.serve("a", vec![1; 8]), |h| h.respond_to_upload("a", response));
        let summary = h.engine.run().await;

        let jobs = h.engine.store().snapshot();
        let job = &jobs[0];
        assert_eq!(job.phase, JobPhase::Finished);
        assert_eq!(job.progress, 100);
        assert_eq!(job.error_message.as_deref(), Some("title required"));
        assert!(job.rendered_edit_form.is_some());
        assert!(job.is_flagged());
        assert_eq!(summary.flagged, 1);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn test_jobs_run_one_at_a_time_in_order() {
        let ids = ["a", "b", "c", "d"];
        let h = harness(
            ids.iter().map(|id| keep(id)).collect(),
            |s| ids.iter().fold(s, |s, id| s.serve(id, vec![1; 64])),
            |h| h.fail_upload("b"),
        );
        h.engine.run().await;

        let events = h.log.events();
        assert_eq!(
            events,
            vec![
                "fetch:a", "upload:a", "uploaded:a",
                "fetch:b", "upload:b",
                "fetch:c", "upload:c", "uploaded:c",
                "fetch:d", "upload:d", "uploaded:d",
            ]
        );
        assert_eq!(h.probe.max_active(), 1);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_per_job() {
        let h = harness(vec![keep("a")], |s| s.serve("a", vec![1; 100]), |h| h);
        h.engine.run().await;

        // fetch start, half downloaded, upload start, half uploaded
        assert_eq!(h.probe.progress_samples(), vec![0, 25, 50, 75]);
        assert_eq!(h.engine.store().snapshot()[0].progress, 100);
    }

    #[tokio::test]
    async fn test_unknown_size_stays_low_until_complete() {
        let h = harness(vec![keep("a")], |s| s.serve_unsized("a", vec![1; 100]), |h| h);
        h.engine.run().await;

        assert_eq!(h.probe.progress_samples(), vec![0, 0, 50, 75]);
        assert_eq!(h.engine.store().snapshot()[0].progress, 100);
    }

    #[tokio::test]
    async fn test_token_read_fresh_per_job() {
        let h = harness(
            vec![keep("a"), keep("b"), keep("c")],
            |s| s.serve("a", vec![1]).fail("b").serve("c", vec![1]),
            |h| h,
        );
        h.engine.run().await;

        assert_eq!(h.tokens.calls(), 3);
        assert_eq!(h.source.tokens_seen(), vec!["token-1", "token-2", "token-3"]);
    }

    #[tokio::test]
    async fn test_resource_key_is_presented() {
        let mut job = keep("a");
        job.resource_key = Some("0-abc".to_string());
        let h = harness(vec![job, keep("b")], |s| s.serve("a", vec![1]).serve("b", vec![1]), |h| h);
        h.engine.run().await;

        assert_eq!(h.source.resource_keys_seen(), vec![Some("0-abc".to_string()), None]);
    }

    #[tokio::test]
    async fn test_failed_jobs_are_not_retried() {
        let h = harness(vec![keep("a")], |s| s.fail("a"), |h| h);
        h.engine.run().await;
        assert!(!h.engine.start_next().await);
        assert_eq!(h.log.events(), vec!["fetch:a"]);
    }

    #[tokio::test]
    async fn test_empty_plan_is_idle() {
        let h = harness(Vec::new(), |s| s, |h| h);
        let summary = h.engine.run().await;
        assert_eq!(summary.total, 0);
        assert!(h.log.events().is_empty());
        assert_eq!(aggregate_progress(&h.engine.store().snapshot()), None);
    }

    #[tokio::test]
    async fn test_busy_engine_refuses_second_dispatch() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            vec![keep("a"), keep("b")],
            |s| s.serve("a", vec![1]).serve("b", vec![1]).gated(gate.clone()),
            |h| h,
        );

        let mut rx = h.engine.store().subscribe();
        let engine = h.engine.clone();
        let run = tokio::spawn(async move { engine.start_next().await });

        rx.wait_for(|jobs| jobs[0].phase == JobPhase::Downloading).await.unwrap();
        assert!(h.engine.is_busy());
        assert!(!h.engine.start_next().await);
        assert_eq!(h.engine.store().snapshot()[1].phase, JobPhase::Pending);

        gate.notify_one();
        assert!(run.await.unwrap());
        assert!(!h.engine.is_busy());
        assert_eq!(h.engine.store().snapshot()[0].phase, JobPhase::Finished);
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatch_after_current_job() {
        let log = EventLog::default();
        let store = JobStore::new(vec![keep("a"), keep("b")]);
        let host = Arc::new(FakeHost::observed(log.clone(), ActiveProbe::default()));
        let tokens = Arc::new(CountingToken::default());

        let shutdown = CancellationToken::new();
        let source = FakeSource::new(log.clone(), ActiveProbe::default())
            .serve("a", vec![1])
            .serve("b", vec![1])
            .cancel_on_fetch(shutdown.clone());
        let engine = SequentialImportEngine::new(store, Arc::new(source), tokens, host, 1)
            .with_shutdown(shutdown);

        let summary = engine.run().await;
        let jobs = engine.store().snapshot();
        assert_eq!(jobs[0].phase, JobPhase::Finished);
        assert_eq!(jobs[1].phase, JobPhase::Pending);
        assert_eq!(summary.pending, 1);
        assert_eq!(log.events(), vec!["fetch:a", "upload:a", "uploaded:a"]);
    }
}
