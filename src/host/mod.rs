//! Host CMS Module
//!
//! HTTP contracts of the Wagtail side: duplicate lookup, asset creation,
//! edit submission and deletion. The import core only sees the `HostApi`
//! trait; `WagtailHost` is the reqwest implementation.

pub mod wagtail;

pub use wagtail::{HostConfig, WagtailHost};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::duplicates::ResolutionAction;
use crate::providers::RemoteFileDescriptor;

/// An existing asset the host considers a duplicate of a remote file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateRecord {
    /// Older host versions send this as `pk`
    #[serde(rename = "wagtail_id", alias = "pk", default)]
    pub existing_asset_id: Option<u64>,
    #[serde(rename = "title", default)]
    pub existing_title: String,
    #[serde(rename = "thumbnail", default)]
    pub existing_thumbnail_url: String,
    #[serde(rename = "created_at", default)]
    pub existing_created_at: String,
}

/// Duplicate lookup result, keyed by remote file id
pub type DuplicateRecords = HashMap<String, DuplicateRecord>;

/// JSON body returned by the creation, edit and delete endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    /// Rendered edit form (HTML fragment)
    #[serde(default)]
    pub form: Option<String>,
    #[serde(default)]
    pub edit_action: Option<String>,
    #[serde(default)]
    pub delete_action: Option<String>,
}

impl HostResponse {
    /// The host's own error text, if it reported one
    pub fn host_error(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.trim().is_empty())
    }
}

/// One file handed to the host's creation endpoint
#[derive(Debug, Clone)]
pub struct AssetUpload {
    pub remote_id: String,
    pub target_asset_id: Option<u64>,
    pub action: ResolutionAction,
    pub name: String,
    pub collection_id: u64,
    pub bytes: Vec<u8>,
}

/// Upload progress callback: `(bytes_sent, total_bytes)`
pub type UploadProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Host-side errors
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Host returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid host response: {0}")]
    Parse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),
}

/// The host endpoints the import core talks to
#[async_trait]
pub trait HostApi: Send + Sync {
    /// One round trip carrying the whole catalog
    async fn find_duplicates(
        &self,
        catalog: &[RemoteFileDescriptor],
    ) -> Result<DuplicateRecords, HostError>;

    /// Multipart POST to the import page
    async fn create_asset(
        &self,
        upload: AssetUpload,
        on_progress: UploadProgress<'_>,
    ) -> Result<HostResponse, HostError>;

    /// Submit the rendered form's fields back to its `edit_action`
    async fn submit_edit(
        &self,
        edit_action: &str,
        remote_id: &str,
        fields: &[(String, String)],
    ) -> Result<HostResponse, HostError>;

    /// Empty POST to a `delete_action`
    async fn delete_asset(&self, delete_action: &str) -> Result<HostResponse, HostError>;
}
