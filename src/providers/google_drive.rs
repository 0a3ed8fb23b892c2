//! Google Drive Source
//!
//! Expands a picker selection into file descriptors and streams file bodies
//! out of Drive API v3. Authentication is handled elsewhere; every call takes
//! the bearer token to use.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{
    resource_key_header, FetchProgress, PickedItem, PickedKind, ProviderError,
    RemoteFileDescriptor, RemoteFileSource,
};

/// Google Drive API base URL
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";

/// Header carrying `<fileId>/<resourceKey>` pairs for link-shared files
pub const RESOURCE_KEYS_HEADER: &str = "X-Goog-Drive-Resource-Keys";

/// Fields requested for every descriptor
const DESCRIPTOR_FIELDS: &str =
    "id,name,thumbnailLink,fileExtension,md5Checksum,size,imageMediaMetadata,resourceKey";

/// Google Drive file list response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    #[serde(default)]
    files: Vec<RemoteFileDescriptor>,
    next_page_token: Option<String>,
}

/// Google Drive source configuration
#[derive(Debug, Clone)]
pub struct GoogleDriveConfig {
    pub api_base: String,
    /// Page size for folder listings (Drive caps this at 1000)
    pub page_size: u32,
}

impl Default for GoogleDriveConfig {
    fn default() -> Self {
        Self {
            api_base: DRIVE_API_BASE.to_string(),
            page_size: 1000,
        }
    }
}

/// Google Drive file source
pub struct GoogleDriveSource {
    config: GoogleDriveConfig,
    client: reqwest::Client,
}

impl GoogleDriveSource {
    pub fn new(config: GoogleDriveConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// Expand a picker selection into the catalog.
    ///
    /// Images inside picked folders come first, followed by individually
    /// picked images in selection order. Items that cannot be described are
    /// logged and skipped.
    pub async fn build_catalog(
        &self,
        picked: &[PickedItem],
        token: &SecretString,
    ) -> Vec<RemoteFileDescriptor> {
        let folders: Vec<&str> = picked
            .iter()
            .filter(|p| p.kind == PickedKind::Folder)
            .map(|p| p.id.as_str())
            .collect();

        let mut catalog = Vec::new();

        if !folders.is_empty() {
            match self.list_folder_images(&folders, token).await {
                Ok(files) => catalog.extend(files),
                Err(e) => warn!("Could not list images in picked folders: {}", e),
            }
        }

        for item in picked.iter().filter(|p| p.kind == PickedKind::File) {
            match self.describe_file(&item.id, token).await {
                Ok(file) => catalog.push(file),
                Err(e) => warn!(remote_id = %item.id, "Could not describe picked file: {}", e),
            }
        }

        // A file picked directly and also inside a picked folder is listed once
        let mut seen = std::collections::HashSet::new();
        catalog.retain(|file| seen.insert(file.id.clone()));

        info!("Catalog built: {} file(s) from {} picked item(s)", catalog.len(), picked.len());
        catalog
    }

    /// Get descriptor for one file by ID
    pub async fn describe_file(
        &self,
        file_id: &str,
        token: &SecretString,
    ) -> Result<RemoteFileDescriptor, ProviderError> {
        let url = url::Url::parse_with_params(
            &self.api_url(&format!("files/{}", urlencoding::encode(file_id))),
            &[("fields", DESCRIPTOR_FIELDS), ("supportsAllDrives", "true")],
        )
        .map_err(|e| ProviderError::InvalidConfig(format!("Invalid Drive URL: {}", e)))?;

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, bearer(token)?)
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;

        let response = check_status(response, file_id).await?;

        response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))
    }

    /// List every image whose parent is one of `folder_ids`
    pub async fn list_folder_images(
        &self,
        folder_ids: &[&str],
        token: &SecretString,
    ) -> Result<Vec<RemoteFileDescriptor>, ProviderError> {
        let query = folder_images_query(folder_ids);
        let fields = format!("nextPageToken,files({})", DESCRIPTOR_FIELDS);
        let page_size = self.config.page_size.clamp(1, 1000).to_string();

        let mut all_files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", page_size.as_str()),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ];
            if let Some(ref token) = page_token {
                params.push(("pageToken", token.as_str()));
            }

            let url = url::Url::parse_with_params(&self.api_url("files"), &params)
                .map_err(|e| ProviderError::InvalidConfig(format!("Invalid Drive URL: {}", e)))?;

            let response = self
                .client
                .get(url)
                .header(AUTHORIZATION, bearer(token)?)
                .send()
                .await
                .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;

            let response = check_status(response, "files.list").await?;

            let list: DriveFileList = response
                .json()
                .await
                .map_err(|e| ProviderError::ParseError(e.to_string()))?;

            debug!("files.list page: {} file(s)", list.files.len());
            all_files.extend(list.files);

            match list.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(all_files)
    }
}

#[async_trait]
impl RemoteFileSource for GoogleDriveSource {
    async fn fetch(
        &self,
        remote_id: &str,
        resource_key: Option<&str>,
        token: &SecretString,
        on_progress: FetchProgress<'_>,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = url::Url::parse_with_params(
            &self.api_url(&format!("files/{}", urlencoding::encode(remote_id))),
            &[("alt", "media"), ("supportsAllDrives", "true")],
        )
        .map_err(|e| ProviderError::InvalidConfig(format!("Invalid Drive URL: {}", e)))?;

        let mut request = self.client.get(url).header(AUTHORIZATION, bearer(token)?);
        if let Some(keys) = resource_key_header(remote_id, resource_key) {
            request = request.header(RESOURCE_KEYS_HEADER, keys);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;

        let response = check_status(response, remote_id).await?;

        let total = response.content_length();
        // One body in memory at a time; cap the pre-allocation anyway
        let capacity = total.unwrap_or(0).min(64 * 1024 * 1024) as usize;
        let mut body = Vec::with_capacity(capacity);

        let mut stream = response.bytes_stream();
        on_progress(0, total);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ProviderError::TransferFailed(e.to_string()))?;
            body.extend_from_slice(&chunk);
            on_progress(body.len() as u64, total);
        }

        info!(remote_id, bytes = body.len(), "Downloaded from Drive");
        Ok(body)
    }
}

/// Drive search query matching images directly inside any of the folders
pub fn folder_images_query(folder_ids: &[&str]) -> String {
    let parents = folder_ids
        .iter()
        .map(|id| format!("'{}' in parents", id.replace('\'', "\\'")))
        .collect::<Vec<_>>()
        .join(" or ");
    format!("(mimeType contains 'image/') and ({})", parents)
}

fn bearer(token: &SecretString) -> Result<HeaderValue, ProviderError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
        .map_err(|e| ProviderError::AuthenticationFailed(format!("Invalid token: {}", e)))?;
    value.set_sensitive(true);
    Ok(value)
}

async fn check_status(
    response: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status.as_u16() {
        401 | 403 => Err(ProviderError::AuthenticationFailed(format!(
            "Drive refused access to {} ({})",
            what, status
        ))),
        404 => Err(ProviderError::NotFound(what.to_string())),
        code => {
            let message = response.text().await.unwrap_or_default();
            Err(ProviderError::ServerError { status: code, message })
        }
    }
}
