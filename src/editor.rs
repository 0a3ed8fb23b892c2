//! Post-import edits
//!
//! Follow-up actions on finished jobs: submit the host's edit form or delete
//! the new asset. These run outside the engine's queue and may overlap with
//! it; each call only ever touches its own job.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::host::{HostApi, HostError, HostResponse};
use crate::jobs::{visible_jobs, ImportJob, JobPhase, JobStore};

/// Shown on the job when the edit request itself did not go through
pub const EDIT_FAILED: &str = "edit failed";
/// Shown on the job when the delete request itself did not go through
pub const DELETE_FAILED: &str = "delete failed";

#[derive(Error, Debug)]
pub enum EditError {
    #[error("No job at index {0}")]
    NoSuchJob(usize),

    #[error("Job {0} has nothing to edit or delete")]
    NotEditable(usize),

    #[error(transparent)]
    Host(#[from] HostError),
}

/// How the host answered an edit or delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// Accepted; the job leaves the visible list
    Settled,
    /// The host refused with its own message and sent a fresh form
    Rejected(String),
}

#[derive(Debug, Clone, Copy)]
enum Followup {
    Edit,
    Delete,
}

impl Followup {
    fn endpoint(self, job: &ImportJob) -> Option<&str> {
        match self {
            Followup::Edit => job.edit_endpoint.as_deref(),
            Followup::Delete => job.delete_endpoint.as_deref(),
        }
    }

    fn sentinel(self) -> &'static str {
        match self {
            Followup::Edit => EDIT_FAILED,
            Followup::Delete => DELETE_FAILED,
        }
    }
}

#[derive(Clone)]
pub struct PostImportEditor {
    store: JobStore,
    host: Arc<dyn HostApi>,
}

impl PostImportEditor {
    pub fn new(store: JobStore, host: Arc<dyn HostApi>) -> Self {
        Self { store, host }
    }

    /// Visible finished jobs that carry an edit form, with their indices
    pub fn editable_jobs(&self) -> Vec<(usize, ImportJob)> {
        let jobs = self.store.snapshot();
        visible_jobs(&jobs)
            .into_iter()
            .filter(|(_, job)| job.phase == JobPhase::Finished && job.rendered_edit_form.is_some())
            .map(|(index, job)| (index, job.clone()))
            .collect()
    }

    /// Post the form fields back to the job's edit endpoint
    pub async fn submit_edit(
        &self,
        index: usize,
        fields: &[(String, String)],
    ) -> Result<EditOutcome, EditError> {
        let (job, endpoint) = self.begin(index, Followup::Edit)?;
        let result = self.host.submit_edit(&endpoint, &job.remote_id, fields).await;
        self.finish(index, &job, Followup::Edit, result)
    }

    /// Delete the asset created by the job
    pub async fn delete(&self, index: usize) -> Result<EditOutcome, EditError> {
        let (job, endpoint) = self.begin(index, Followup::Delete)?;
        let result = self.host.delete_asset(&endpoint).await;
        self.finish(index, &job, Followup::Delete, result)
    }

    fn begin(&self, index: usize, followup: Followup) -> Result<(ImportJob, String), EditError> {
        self.store
            .try_update(index, |job| {
                if job.phase != JobPhase::Finished || job.settled {
                    return Err(EditError::NotEditable(index));
                }
                let endpoint = followup
                    .endpoint(job)
                    .filter(|e| !e.is_empty())
                    .ok_or(EditError::NotEditable(index))?
                    .to_string();
                let before = job.clone();
                job.phase = JobPhase::AwaitingEdit;
                Ok((before, endpoint))
            })
            .unwrap_or(Err(EditError::NoSuchJob(index)))
    }

    fn finish(
        &self,
        index: usize,
        job: &ImportJob,
        followup: Followup,
        result: Result<HostResponse, HostError>,
    ) -> Result<EditOutcome, EditError> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(job = index, remote_id = %job.remote_id, "{:?} request failed: {}", followup, e);
                self.store.update(index, |j| {
                    j.phase = JobPhase::Finished;
                    j.error_message = Some(followup.sentinel().to_string());
                });
                return Err(e.into());
            }
        };

        match response.host_error().map(str::to_string) {
            None => {
                info!(job = index, remote_id = %job.remote_id, "{:?} accepted", followup);
                self.store.update(index, |j| {
                    j.phase = JobPhase::Finished;
                    j.error_message = None;
                    j.settled = true;
                });
                Ok(EditOutcome::Settled)
            }
            Some(message) => {
                warn!(job = index, remote_id = %job.remote_id, "{:?} rejected: {}", followup, message);
                let outcome = EditOutcome::Rejected(message.clone());
                self.store.update(index, |j| {
                    j.phase = JobPhase::Finished;
                    j.error_message = Some(message);
                    if response.form.is_some() {
                        j.rendered_edit_form = response.form;
                    }
                    if response.edit_action.is_some() {
                        j.edit_endpoint = response.edit_action;
                    }
                    if response.delete_action.is_some() {
                        j.delete_endpoint = response.delete_action;
                    }
                });
                Ok(outcome)
            }
        }
    }
}
