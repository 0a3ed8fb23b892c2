// Drive Image Import - Google Drive to Wagtail image importer
// Duplicate review and sequential import core

pub mod config;
pub mod duplicates;
pub mod editor;
pub mod engine;
pub mod host;
pub mod jobs;
pub mod plan;
pub mod providers;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, ImportConfig};
pub use duplicates::{
    uniform_action, ConfirmedActions, DuplicateResolver, DuplicateRow, ResolutionAction, ResolveError,
};
pub use editor::{EditError, EditOutcome, PostImportEditor};
pub use engine::SequentialImportEngine;
pub use host::{DuplicateRecord, DuplicateRecords, HostApi, HostError, HostResponse, WagtailHost};
pub use jobs::{aggregate_progress, visible_jobs, ImportJob, ImportSummary, JobPhase, JobStore};
pub use plan::{build_import_plan, PlanError};
pub use providers::{
    PickedItem, ProviderError, RemoteFileDescriptor, RemoteFileSource, StaticToken, TokenSource,
};
pub use workflow::{ImportRun, ImportWorkflow, WorkflowError};
