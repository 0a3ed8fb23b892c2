//! Duplicate review
//!
//! Classifies the catalog against the host's duplicate lookup and collects
//! one resolution action per duplicate until the user confirms.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{error, info};

use crate::host::{DuplicateRecord, DuplicateRecords, HostApi, HostError};
use crate::providers::RemoteFileDescriptor;

/// What to do with a file that already exists on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionAction {
    /// Overwrite the existing asset's file
    Replace,
    /// Import as a new asset alongside the existing one
    Keep,
    /// Skip the file entirely
    Cancel,
}

impl ResolutionAction {
    /// Form value expected by the host's creation endpoint
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionAction::Replace => "replace",
            ResolutionAction::Keep => "keep",
            ResolutionAction::Cancel => "cancel",
        }
    }
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(ResolutionAction::Replace),
            "keep" => Ok(ResolutionAction::Keep),
            "cancel" => Ok(ResolutionAction::Cancel),
            other => Err(format!("unknown action '{}' (expected replace, keep or cancel)", other)),
        }
    }
}

/// The action shared by every entry, or `None` when they differ ("mixed")
/// or there are none.
pub fn uniform_action<'a, I>(actions: I) -> Option<ResolutionAction>
where
    I: IntoIterator<Item = &'a ResolutionAction>,
{
    let mut actions = actions.into_iter();
    let first = *actions.next()?;
    actions.all(|a| *a == first).then_some(first)
}

/// Actions the user confirmed, keyed by remote id. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmedActions(HashMap<String, ResolutionAction>);

impl ConfirmedActions {
    pub fn get(&self, remote_id: &str) -> Option<ResolutionAction> {
        self.0.get(remote_id).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, ResolutionAction)> for ConfirmedActions {
    fn from_iter<T: IntoIterator<Item = (String, ResolutionAction)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Resolver misuse
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Duplicate lookup has not completed")]
    NotReviewing,

    #[error("Duplicate actions were already confirmed")]
    AlreadyConfirmed,

    #[error("Bulk action is disabled while duplicate actions differ")]
    BulkActionDisabled,

    #[error("{0} is not a duplicate")]
    UnknownDuplicate(String),
}

#[derive(Debug, Clone)]
enum ResolverState {
    /// Waiting for (or stuck after) the lookup
    Loading,
    Reviewing(HashMap<String, ResolutionAction>),
    Confirmed(ConfirmedActions),
}

/// One duplicate as shown for review
#[derive(Debug, Clone, Copy)]
pub struct DuplicateRow<'a> {
    pub file: &'a RemoteFileDescriptor,
    pub existing: &'a DuplicateRecord,
    pub action: ResolutionAction,
}

/// Duplicate review state machine: `Loading → Reviewing → Confirmed`
#[derive(Debug, Clone)]
pub struct DuplicateResolver {
    catalog: Vec<RemoteFileDescriptor>,
    records: DuplicateRecords,
    state: ResolverState,
}

impl DuplicateResolver {
    pub fn new(catalog: Vec<RemoteFileDescriptor>) -> Self {
        Self {
            catalog,
            records: DuplicateRecords::new(),
            state: ResolverState::Loading,
        }
    }

    pub fn catalog(&self) -> &[RemoteFileDescriptor] {
        &self.catalog
    }

    pub fn records(&self) -> &DuplicateRecords {
        &self.records
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, ResolverState::Loading)
    }

    pub fn is_reviewing(&self) -> bool {
        matches!(self.state, ResolverState::Reviewing(_))
    }

    pub fn confirmed(&self) -> Option<&ConfirmedActions> {
        match &self.state {
            ResolverState::Confirmed(actions) => Some(actions),
            _ => None,
        }
    }

    /// Ask the host which catalog entries already exist.
    ///
    /// On failure the error is logged and the resolver stays in `Loading`;
    /// nothing is retried.
    pub async fn lookup(&mut self, host: &dyn HostApi) -> Result<(), HostError> {
        if !self.is_loading() {
            return Ok(());
        }
        match host.find_duplicates(&self.catalog).await {
            Ok(records) => {
                self.apply_lookup(records);
                Ok(())
            }
            Err(e) => {
                error!("Duplicate lookup failed: {}", e);
                Err(e)
            }
        }
    }

    /// Take the host's lookup result. Every duplicate starts as `Replace`;
    /// with no duplicates the resolver confirms immediately.
    pub fn apply_lookup(&mut self, records: DuplicateRecords) {
        let records: DuplicateRecords = records
            .into_iter()
            .filter(|(id, _)| self.catalog.iter().any(|f| &f.id == id))
            .collect();

        if records.is_empty() {
            info!("No duplicates found; skipping review");
            self.records = records;
            self.state = ResolverState::Confirmed(ConfirmedActions::default());
            return;
        }

        info!("{} duplicate(s) need review", records.len());
        let actions = records
            .keys()
            .map(|id| (id.clone(), ResolutionAction::Replace))
            .collect();
        self.records = records;
        self.state = ResolverState::Reviewing(actions);
    }

    /// Duplicates in catalog (picker selection) order
    pub fn duplicate_rows(&self) -> Vec<DuplicateRow<'_>> {
        self.catalog
            .iter()
            .filter_map(|file| {
                let existing = self.records.get(&file.id)?;
                let action = self.action(&file.id)?;
                Some(DuplicateRow { file, existing, action })
            })
            .collect()
    }

    /// Current action for one duplicate
    pub fn action(&self, remote_id: &str) -> Option<ResolutionAction> {
        match &self.state {
            ResolverState::Loading => None,
            ResolverState::Reviewing(actions) => actions.get(remote_id).copied(),
            ResolverState::Confirmed(actions) => actions.get(remote_id),
        }
    }

    /// The bulk control's value; `None` while actions are mixed
    pub fn uniform_action(&self) -> Option<ResolutionAction> {
        match &self.state {
            ResolverState::Reviewing(actions) => uniform_action(actions.values()),
            _ => None,
        }
    }

    fn reviewing_mut(&mut self) -> Result<&mut HashMap<String, ResolutionAction>, ResolveError> {
        match &mut self.state {
            ResolverState::Loading => Err(ResolveError::NotReviewing),
            ResolverState::Reviewing(actions) => Ok(actions),
            ResolverState::Confirmed(_) => Err(ResolveError::AlreadyConfirmed),
        }
    }

    pub fn set_action(&mut self, remote_id: &str, action: ResolutionAction) -> Result<(), ResolveError> {
        let actions = self.reviewing_mut()?;
        match actions.get_mut(remote_id) {
            Some(slot) => {
                *slot = action;
                Ok(())
            }
            None => Err(ResolveError::UnknownDuplicate(remote_id.to_string())),
        }
    }

    /// Set every duplicate to `action` at once. Only available while all
    /// actions agree.
    pub fn set_all_actions(&mut self, action: ResolutionAction) -> Result<(), ResolveError> {
        let actions = self.reviewing_mut()?;
        if uniform_action(actions.values()).is_none() {
            return Err(ResolveError::BulkActionDisabled);
        }
        actions.values_mut().for_each(|a| *a = action);
        Ok(())
    }

    /// Freeze the actions and hand them downstream
    pub fn confirm(&mut self) -> Result<&ConfirmedActions, ResolveError> {
        let actions: ConfirmedActions = std::mem::take(self.reviewing_mut()?).into_iter().collect();
        info!("Confirmed actions for {} duplicate(s)", actions.len());
        self.state = ResolverState::Confirmed(actions);
        self.confirmed().ok_or(ResolveError::NotReviewing)
    }
}
