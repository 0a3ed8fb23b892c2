//! Import jobs and the shared job store
//!
//! The job list is the only mutable state shared between the engine, the
//! post-import editor and whoever renders progress. Every mutation publishes
//! a fresh snapshot, so readers never see a half-written job.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::duplicates::ResolutionAction;

/// Error shown on a job whose download did not complete
pub const DOWNLOAD_FAILED: &str = "download failed";
/// Error shown on a job whose upload did not complete
pub const UPLOAD_FAILED: &str = "upload failed";

/// Lifecycle of a single job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Pending,
    Downloading,
    Uploading,
    /// An edit or delete request for a finished job is in flight
    AwaitingEdit,
    Finished,
    Failed,
}

impl JobPhase {
    /// Holding the transfer slot
    pub fn is_active(self) -> bool {
        matches!(self, JobPhase::Downloading | JobPhase::Uploading)
    }

    /// The primary transfer is over, one way or the other
    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Finished | JobPhase::Failed | JobPhase::AwaitingEdit)
    }
}

/// One file's transfer-and-upload unit of work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportJob {
    pub remote_id: String,
    pub resource_key: Option<String>,
    pub name: String,
    pub thumbnail_url: String,
    pub action: ResolutionAction,
    /// Present iff `action` is `Replace`
    pub target_asset_id: Option<u64>,
    /// 0..=100; first half is the download, second half the upload
    pub progress: u8,
    pub phase: JobPhase,
    pub error_message: Option<String>,
    pub edit_endpoint: Option<String>,
    pub delete_endpoint: Option<String>,
    pub rendered_edit_form: Option<String>,
    /// Edited or deleted after import; hidden from the visible list
    pub settled: bool,
}

impl ImportJob {
    pub fn pending(
        remote_id: impl Into<String>,
        name: impl Into<String>,
        action: ResolutionAction,
        target_asset_id: Option<u64>,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            resource_key: None,
            name: name.into(),
            thumbnail_url: String::new(),
            action,
            target_asset_id,
            progress: 0,
            phase: JobPhase::Pending,
            error_message: None,
            edit_endpoint: None,
            delete_endpoint: None,
            rendered_edit_form: None,
            settled: false,
        }
    }

    /// A job for an asset imported earlier, known only by its host endpoints
    pub fn imported(
        remote_id: impl Into<String>,
        edit_endpoint: Option<String>,
        delete_endpoint: Option<String>,
    ) -> Self {
        let mut job = Self::pending(remote_id, "", ResolutionAction::Keep, None);
        job.phase = JobPhase::Finished;
        job.progress = 100;
        job.edit_endpoint = edit_endpoint;
        job.delete_endpoint = delete_endpoint;
        job
    }

    /// Progress as counted in the aggregate: terminal jobs count as complete
    pub fn effective_progress(&self) -> u8 {
        if self.phase.is_terminal() {
            100
        } else {
            self.progress.min(100)
        }
    }

    /// Finished, but the host attached an error message to it
    pub fn is_flagged(&self) -> bool {
        self.phase == JobPhase::Finished && self.error_message.is_some()
    }
}

/// Rounded mean of the jobs' effective progress; `None` when there is
/// nothing to show a progress bar for.
pub fn aggregate_progress(jobs: &[ImportJob]) -> Option<u8> {
    if jobs.is_empty() {
        return None;
    }
    let sum: u32 = jobs.iter().map(|j| j.effective_progress() as u32).sum();
    Some((sum as f64 / jobs.len() as f64).round() as u8)
}

/// Jobs still shown to the user, with their stable indices
pub fn visible_jobs(jobs: &[ImportJob]) -> Vec<(usize, &ImportJob)> {
    jobs.iter().enumerate().filter(|(_, j)| !j.settled).collect()
}

/// End-of-run counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub total: usize,
    pub finished: usize,
    pub failed: usize,
    /// Finished with a host-reported error
    pub flagged: usize,
    pub pending: usize,
}

impl ImportSummary {
    pub fn from_jobs(jobs: &[ImportJob]) -> Self {
        let mut summary = Self { total: jobs.len(), ..Self::default() };
        for job in jobs {
            match job.phase {
                JobPhase::Finished | JobPhase::AwaitingEdit => {
                    summary.finished += 1;
                    if job.error_message.is_some() {
                        summary.flagged += 1;
                    }
                }
                JobPhase::Failed => summary.failed += 1,
                JobPhase::Pending | JobPhase::Downloading | JobPhase::Uploading => {
                    summary.pending += 1
                }
            }
        }
        summary
    }
}

/// Snapshot-publishing container for the job list
#[derive(Clone)]
pub struct JobStore {
    tx: Arc<watch::Sender<Arc<Vec<ImportJob>>>>,
}

impl JobStore {
    pub fn new(jobs: Vec<ImportJob>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(jobs));
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<Vec<ImportJob>> {
        self.tx.borrow().clone()
    }

    /// Receive a new snapshot on every change
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<ImportJob>>> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `f` to one job and publish the result as a new snapshot.
    /// Returns false when `index` is out of range.
    pub fn update<F>(&self, index: usize, f: F) -> bool
    where
        F: FnOnce(&mut ImportJob),
    {
        self.tx.send_if_modified(|jobs| {
            if index >= jobs.len() {
                return false;
            }
            let mut next: Vec<ImportJob> = (**jobs).clone();
            f(&mut next[index]);
            *jobs = Arc::new(next);
            true
        })
    }

    /// Run `f` on a copy of one job and publish the copy only when `f`
    /// returns `Ok`. The check and the write happen under one lock, so two
    /// callers racing on the same job cannot both pass. `None` when `index`
    /// is out of range.
    pub fn try_update<T, E, F>(&self, index: usize, f: F) -> Option<Result<T, E>>
    where
        F: FnOnce(&mut ImportJob) -> Result<T, E>,
    {
        let mut outcome = None;
        self.tx.send_if_modified(|jobs| {
            let Some(current) = jobs.get(index) else {
                return false;
            };
            let mut job = current.clone();
            let result = f(&mut job);
            let accepted = result.is_ok();
            outcome = Some(result);
            if !accepted {
                return false;
            }
            let mut next: Vec<ImportJob> = (**jobs).clone();
            next[index] = job;
            *jobs = Arc::new(next);
            true
        });
        outcome
    }

    /// Raise a job's progress; lower or equal values publish nothing
    pub fn raise_progress(&self, index: usize, progress: u8) -> bool {
        self.tx.send_if_modified(|jobs| {
            match jobs.get(index) {
                Some(job) if job.progress < progress => {}
                _ => return false,
            }
            let mut next: Vec<ImportJob> = (**jobs).clone();
            next[index].progress = progress.min(100);
            *jobs = Arc::new(next);
            true
        })
    }
}
