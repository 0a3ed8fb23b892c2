//! Import plan builder

use std::collections::HashSet;
use thiserror::Error;

use crate::duplicates::{ConfirmedActions, ResolutionAction};
use crate::host::DuplicateRecords;
use crate::jobs::ImportJob;
use crate::providers::RemoteFileDescriptor;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanError {
    #[error("Cannot replace {0}: the host did not report an existing asset id")]
    MissingTargetAsset(String),

    #[error("Remote file {0} appears more than once in the catalog")]
    DuplicateRemoteId(String),
}

/// Turn the catalog into ordered jobs.
///
/// Non-duplicates resolve to `Keep`, duplicates to their confirmed action
/// (`Replace` if none was confirmed). `Cancel` entries never become jobs.
pub fn build_import_plan(
    catalog: &[RemoteFileDescriptor],
    records: &DuplicateRecords,
    confirmed: &ConfirmedActions,
) -> Result<Vec<ImportJob>, PlanError> {
    let mut seen = HashSet::new();
    let mut jobs = Vec::with_capacity(catalog.len());

    for file in catalog {
        if !seen.insert(file.id.as_str()) {
            return Err(PlanError::DuplicateRemoteId(file.id.clone()));
        }

        let record = records.get(&file.id);
        let action = match record {
            Some(_) => confirmed.get(&file.id).unwrap_or(ResolutionAction::Replace),
            None => ResolutionAction::Keep,
        };

        let target_asset_id = match action {
            ResolutionAction::Cancel => continue,
            ResolutionAction::Keep => None,
            ResolutionAction::Replace => Some(
                record
                    .and_then(|r| r.existing_asset_id)
                    .ok_or_else(|| PlanError::MissingTargetAsset(file.id.clone()))?,
            ),
        };

        let mut job = ImportJob::pending(file.id.clone(), file.name.clone(), action, target_asset_id);
        job.resource_key = file.resource_key.clone();
        job.thumbnail_url = file.thumbnail_url.clone();
        jobs.push(job);
    }

    Ok(jobs)
}
