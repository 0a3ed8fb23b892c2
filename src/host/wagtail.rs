//! Wagtail Host Client
//!
//! reqwest implementation of `HostApi`. Every mutating request carries the
//! CSRF token and the XHR marker the admin views require.

use async_trait::async_trait;
use futures_util::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, COOKIE};
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use super::{AssetUpload, DuplicateRecords, HostApi, HostError, HostResponse, UploadProgress};
use crate::providers::RemoteFileDescriptor;

/// Chunk size used when streaming an upload body
const UPLOAD_CHUNK: usize = 64 * 1024;

const CSRF_HEADER: &str = "x-csrftoken";
const XHR_HEADER: &str = "x-requested-with";

/// Where and how to reach the Wagtail admin
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub base_url: Url,
    /// The import page; also the asset creation endpoint
    pub import_path: String,
    pub duplicate_review_path: String,
    pub csrf_token: SecretString,
    pub session_cookie: Option<SecretString>,
}

/// Wagtail admin client
pub struct WagtailHost {
    config: HostConfig,
    client: reqwest::Client,
}

impl WagtailHost {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Resolve a path or URL from a host response against the admin base URL
    pub fn resolve(&self, path_or_url: &str) -> Result<Url, HostError> {
        self.config
            .base_url
            .join(path_or_url)
            .map_err(|e| HostError::InvalidUrl(format!("{}: {}", path_or_url, e)))
    }

    fn headers(&self) -> Result<HeaderMap, HostError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(
            HeaderName::from_static(XHR_HEADER),
            HeaderValue::from_static("XMLHttpRequest"),
        );

        let mut csrf = HeaderValue::from_str(self.config.csrf_token.expose_secret())
            .map_err(|e| HostError::InvalidHeader(format!("{}: {}", CSRF_HEADER, e)))?;
        csrf.set_sensitive(true);
        headers.insert(HeaderName::from_static(CSRF_HEADER), csrf);

        if let Some(ref cookie) = self.config.session_cookie {
            let mut value = HeaderValue::from_str(cookie.expose_secret())
                .map_err(|e| HostError::InvalidHeader(format!("Cookie: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(COOKIE, value);
        }
        Ok(headers)
    }

    async fn post_multipart(&self, url: Url, form: Form) -> Result<HostResponse, HostError> {
        let response = self
            .client
            .post(url)
            .headers(self.headers()?)
            .multipart(form)
            .send()
            .await
            .map_err(|e| HostError::Transport(e.to_string()))?;
        parse_response(response).await
    }
}

#[async_trait]
impl HostApi for WagtailHost {
    async fn find_duplicates(
        &self,
        catalog: &[RemoteFileDescriptor],
    ) -> Result<DuplicateRecords, HostError> {
        let url = self.resolve(&self.config.duplicate_review_path)?;
        debug!("Looking up duplicates for {} file(s) at {}", catalog.len(), url);

        let response = self
            .client
            .post(url)
            .headers(self.headers()?)
            .json(catalog)
            .send()
            .await
            .map_err(|e| HostError::Transport(e.to_string()))?;

        let response = ensure_success(response).await?;
        let records: DuplicateRecords = response
            .json()
            .await
            .map_err(|e| HostError::Parse(e.to_string()))?;

        info!("Host reported {} duplicate(s)", records.len());
        Ok(records)
    }

    async fn create_asset(
        &self,
        upload: AssetUpload,
        on_progress: UploadProgress<'_>,
    ) -> Result<HostResponse, HostError> {
        let url = self.resolve(&self.config.import_path)?;
        let total = upload.bytes.len() as u64;
        let mime = mime_guess::from_path(&upload.name).first_or_octet_stream();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let body = reqwest::Body::wrap_stream(upload_stream(upload.bytes, tx));
        let file_part = Part::stream_with_length(body, total)
            .file_name(upload.name.clone())
            .mime_str(mime.essence_str())
            .map_err(|e| HostError::InvalidHeader(e.to_string()))?;

        let mut form = Form::new().text("drive_id", upload.remote_id.clone());
        if let Some(id) = upload.target_asset_id {
            form = form.text("wagtail_id", id.to_string());
        }
        let form = form
            .text("action", upload.action.as_str())
            .text("name", upload.name.clone())
            .text("collection", upload.collection_id.to_string())
            .part("image_file", file_part);

        let send = self
            .client
            .post(url)
            .headers(self.headers()?)
            .multipart(form)
            .send();
        tokio::pin!(send);

        let result = loop {
            tokio::select! {
                result = &mut send => break result,
                Some(sent) = rx.recv() => on_progress(sent, total),
            }
        };
        while let Ok(sent) = rx.try_recv() {
            on_progress(sent, total);
        }

        let response = result.map_err(|e| HostError::Transport(e.to_string()))?;
        parse_response(response).await
    }

    async fn submit_edit(
        &self,
        edit_action: &str,
        remote_id: &str,
        fields: &[(String, String)],
    ) -> Result<HostResponse, HostError> {
        let url = self.resolve(edit_action)?;
        let form = fields
            .iter()
            .fold(Form::new(), |form, (name, value)| form.text(name.clone(), value.clone()))
            .text("drive_id", remote_id.to_string());
        self.post_multipart(url, form).await
    }

    async fn delete_asset(&self, delete_action: &str) -> Result<HostResponse, HostError> {
        let url = self.resolve(delete_action)?;
        let response = self
            .client
            .post(url)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(|e| HostError::Transport(e.to_string()))?;
        parse_response(response).await
    }
}

/// Stream `data` in fixed chunks, reporting the running byte count as each
/// chunk is handed to the transport.
fn upload_stream(
    data: Vec<u8>,
    progress: mpsc::UnboundedSender<u64>,
) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> + Send + 'static {
    futures_util::stream::unfold((data, 0usize), move |(data, offset)| {
        let progress = progress.clone();
        async move {
            if offset >= data.len() {
                return None;
            }
            let end = (offset + UPLOAD_CHUNK).min(data.len());
            let chunk = data[offset..end].to_vec();
            let _ = progress.send(end as u64);
            Some((Ok(chunk), (data, end)))
        }
    })
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, HostError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(HostError::Status { status: status.as_u16(), body })
}

async fn parse_response(response: reqwest::Response) -> Result<HostResponse, HostError> {
    let response = ensure_success(response).await?;
    response
        .json()
        .await
        .map_err(|e| HostError::Parse(e.to_string()))
}
