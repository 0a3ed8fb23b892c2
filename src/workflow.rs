//! End-to-end import workflow
//!
//! Wires the stages together in the only order they may run:
//! duplicate lookup, user confirmation, plan, then the engine and the
//! post-import editor sharing one job store.

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::duplicates::DuplicateResolver;
use crate::editor::PostImportEditor;
use crate::engine::SequentialImportEngine;
use crate::host::{HostApi, HostError};
use crate::jobs::JobStore;
use crate::plan::{build_import_plan, PlanError};
use crate::providers::{RemoteFileDescriptor, RemoteFileSource, TokenSource};

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Duplicate actions have not been confirmed")]
    NotConfirmed,

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// A started import: the engine and the editor over the same jobs
pub struct ImportRun {
    pub engine: Arc<SequentialImportEngine>,
    pub editor: PostImportEditor,
}

impl ImportRun {
    pub fn store(&self) -> &JobStore {
        self.engine.store()
    }
}

pub struct ImportWorkflow {
    resolver: DuplicateResolver,
    source: Arc<dyn RemoteFileSource>,
    tokens: Arc<dyn TokenSource>,
    host: Arc<dyn HostApi>,
    collection_id: u64,
}

impl ImportWorkflow {
    pub fn new(
        catalog: Vec<RemoteFileDescriptor>,
        source: Arc<dyn RemoteFileSource>,
        tokens: Arc<dyn TokenSource>,
        host: Arc<dyn HostApi>,
        collection_id: u64,
    ) -> Self {
        Self {
            resolver: DuplicateResolver::new(catalog),
            source,
            tokens,
            host,
            collection_id,
        }
    }

    pub fn resolver(&self) -> &DuplicateResolver {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut DuplicateResolver {
        &mut self.resolver
    }

    pub async fn lookup_duplicates(&mut self) -> Result<(), HostError> {
        self.resolver.lookup(self.host.as_ref()).await
    }

    /// Build the plan and hand it to a fresh engine. Requires confirmed
    /// duplicate actions.
    pub fn start(&self) -> Result<ImportRun, WorkflowError> {
        let confirmed = self.resolver.confirmed().ok_or(WorkflowError::NotConfirmed)?;
        let jobs = build_import_plan(self.resolver.catalog(), self.resolver.records(), confirmed)?;
        info!(
            "Import plan: {} job(s) from {} catalog file(s)",
            jobs.len(),
            self.resolver.catalog().len()
        );

        let store = JobStore::new(jobs);
        let engine = SequentialImportEngine::new(
            store.clone(),
            self.source.clone(),
            self.tokens.clone(),
            self.host.clone(),
            self.collection_id,
        );
        Ok(ImportRun {
            engine: Arc::new(engine),
            editor: PostImportEditor::new(store, self.host.clone()),
        })
    }
}
