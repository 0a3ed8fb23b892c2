//! In-memory collaborators for driving the import core in tests

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::duplicates::ResolutionAction;
use crate::host::{
    AssetUpload, DuplicateRecord, DuplicateRecords, HostApi, HostError, HostResponse, UploadProgress,
};
use crate::jobs::JobStore;
use crate::providers::{FetchProgress, ProviderError, RemoteFileDescriptor, RemoteFileSource, TokenSource};

pub fn descriptor(id: &str) -> RemoteFileDescriptor {
    RemoteFileDescriptor::new(id, format!("{}.png", id))
}

pub fn duplicate(asset_id: u64) -> DuplicateRecord {
    DuplicateRecord {
        existing_asset_id: Some(asset_id),
        existing_title: format!("wagtail_{}.png", asset_id),
        existing_thumbnail_url: format!("/media/images/{}.max-165x165.png", asset_id),
        existing_created_at: "01.02.2021. 10:30".to_string(),
    }
}

/// What a successful creation looks like for `remote_id`
pub fn created(remote_id: &str) -> HostResponse {
    HostResponse {
        success: Some(true),
        error: None,
        form: Some(format!("<form data-drive-id=\"{}\"></form>", remote_id)),
        edit_action: Some(format!("/admin/image-import/edit/{}/", remote_id)),
        delete_action: Some(format!("/admin/image-import/delete/{}/", remote_id)),
    }
}

/// Ordered record of what the fakes were asked to do
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Counts active jobs in the store every time a fake is called
#[derive(Clone, Default)]
pub struct ActiveProbe {
    store: Arc<Mutex<Option<JobStore>>>,
    max_active: Arc<AtomicUsize>,
    progress: Arc<Mutex<Vec<u8>>>,
}

impl ActiveProbe {
    pub fn attach(&self, store: &JobStore) {
        *self.store.lock().unwrap() = Some(store.clone());
    }

    fn sample(&self) {
        if let Some(store) = self.store.lock().unwrap().as_ref() {
            let jobs = store.snapshot();
            let mut active = jobs.iter().filter(|j| j.phase.is_active());
            if let Some(job) = active.clone().next() {
                self.progress.lock().unwrap().push(job.progress);
            }
            self.max_active.fetch_max(active.count(), Ordering::SeqCst);
        }
    }

    /// Progress of the active job at every sample
    pub fn progress_samples(&self) -> Vec<u8> {
        self.progress.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

enum FetchOutcome {
    Bytes { data: Vec<u8>, report_total: bool },
    Fail,
}

/// Remote source serving canned bodies
#[derive(Default)]
pub struct FakeSource {
    outcomes: HashMap<String, FetchOutcome>,
    log: EventLog,
    probe: ActiveProbe,
    tokens: Mutex<Vec<String>>,
    resource_keys: Mutex<Vec<Option<String>>>,
    gate: Option<Arc<Notify>>,
    cancel_on_fetch: Option<CancellationToken>,
}

impl FakeSource {
    pub fn new(log: EventLog, probe: ActiveProbe) -> Self {
        Self { log, probe, ..Self::default() }
    }

    pub fn serve(mut self, remote_id: &str, data: Vec<u8>) -> Self {
        self.outcomes
            .insert(remote_id.to_string(), FetchOutcome::Bytes { data, report_total: true });
        self
    }

    /// Serve without a Content-Length
    pub fn serve_unsized(mut self, remote_id: &str, data: Vec<u8>) -> Self {
        self.outcomes
            .insert(remote_id.to_string(), FetchOutcome::Bytes { data, report_total: false });
        self
    }

    pub fn fail(mut self, remote_id: &str) -> Self {
        self.outcomes.insert(remote_id.to_string(), FetchOutcome::Fail);
        self
    }

    /// Hold every fetch until `gate` is notified
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn cancel_on_fetch(mut self, token: CancellationToken) -> Self {
        self.cancel_on_fetch = Some(token);
        self
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn resource_keys_seen(&self) -> Vec<Option<String>> {
        self.resource_keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteFileSource for FakeSource {
    async fn fetch(
        &self,
        remote_id: &str,
        resource_key: Option<&str>,
        token: &SecretString,
        on_progress: FetchProgress<'_>,
    ) -> Result<Vec<u8>, ProviderError> {
        self.log.push(format!("fetch:{}", remote_id));
        self.tokens.lock().unwrap().push(token.expose_secret().to_string());
        self.resource_keys.lock().unwrap().push(resource_key.map(str::to_string));
        self.probe.sample();

        if let Some(token) = &self.cancel_on_fetch {
            token.cancel();
        }
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        match self.outcomes.get(remote_id) {
            Some(FetchOutcome::Bytes { data, report_total }) => {
                let total = report_total.then_some(data.len() as u64);
                let half = data.len() as u64 / 2;
                on_progress(half, total);
                self.probe.sample();
                on_progress(data.len() as u64, total);
                Ok(data.clone())
            }
            Some(FetchOutcome::Fail) | None => {
                Err(ProviderError::ConnectionFailed(format!("connection reset fetching {}", remote_id)))
            }
        }
    }
}

/// Token source handing out a new token on every call
#[derive(Default)]
pub struct CountingToken {
    calls: AtomicUsize,
}

impl CountingToken {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for CountingToken {
    async fn access_token(&self) -> Result<SecretString, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SecretString::from(format!("token-{}", n)))
    }
}

/// What the fake host received for one creation call
#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub remote_id: String,
    pub target_asset_id: Option<u64>,
    pub action: ResolutionAction,
    pub name: String,
    pub collection_id: u64,
    pub size: usize,
}

/// Host answering from canned responses
#[derive(Default)]
pub struct FakeHost {
    duplicates: Option<DuplicateRecords>,
    lookup_fails: bool,
    lookups: Mutex<Vec<Vec<String>>>,
    create_failures: Vec<String>,
    create_responses: HashMap<String, HostResponse>,
    uploads: Mutex<Vec<RecordedUpload>>,
    edit_responses: Mutex<VecDeque<Result<HostResponse, ()>>>,
    edits: Mutex<Vec<(String, String, Vec<(String, String)>)>>,
    delete_responses: Mutex<VecDeque<Result<HostResponse, ()>>>,
    deletes: Mutex<Vec<String>>,
    log: EventLog,
    probe: ActiveProbe,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observed(log: EventLog, probe: ActiveProbe) -> Self {
        Self { log, probe, ..Self::default() }
    }

    pub fn with_duplicates(mut self, entries: &[(&str, DuplicateRecord)]) -> Self {
        self.duplicates = Some(entries.iter().map(|(id, r)| (id.to_string(), r.clone())).collect());
        self
    }

    pub fn with_failing_lookup(mut self) -> Self {
        self.lookup_fails = true;
        self
    }

    pub fn fail_upload(mut self, remote_id: &str) -> Self {
        self.create_failures.push(remote_id.to_string());
        self
    }

    pub fn respond_to_upload(mut self, remote_id: &str, response: HostResponse) -> Self {
        self.create_responses.insert(remote_id.to_string(), response);
        self
    }

    /// Queue the answer to the next edit; unqueued edits succeed with an empty body
    pub fn queue_edit(self, response: Result<HostResponse, ()>) -> Self {
        self.edit_responses.lock().unwrap().push_back(response);
        self
    }

    pub fn queue_delete(self, response: Result<HostResponse, ()>) -> Self {
        self.delete_responses.lock().unwrap().push_back(response);
        self
    }

    pub fn lookups(&self) -> Vec<Vec<String>> {
        self.lookups.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn edits(&self) -> Vec<(String, String, Vec<(String, String)>)> {
        self.edits.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

fn settled_response() -> HostResponse {
    HostResponse { success: Some(true), ..HostResponse::default() }
}

#[async_trait]
impl HostApi for FakeHost {
    async fn find_duplicates(
        &self,
        catalog: &[RemoteFileDescriptor],
    ) -> Result<DuplicateRecords, HostError> {
        self.lookups
            .lock()
            .unwrap()
            .push(catalog.iter().map(|f| f.id.clone()).collect());
        if self.lookup_fails {
            return Err(HostError::Status { status: 500, body: "boom".to_string() });
        }
        Ok(self.duplicates.clone().unwrap_or_default())
    }

    async fn create_asset(
        &self,
        upload: AssetUpload,
        on_progress: UploadProgress<'_>,
    ) -> Result<HostResponse, HostError> {
        self.log.push(format!("upload:{}", upload.remote_id));
        self.probe.sample();

        let total = upload.bytes.len() as u64;
        self.uploads.lock().unwrap().push(RecordedUpload {
            remote_id: upload.remote_id.clone(),
            target_asset_id: upload.target_asset_id,
            action: upload.action,
            name: upload.name.clone(),
            collection_id: upload.collection_id,
            size: upload.bytes.len(),
        });

        if self.create_failures.contains(&upload.remote_id) {
            return Err(HostError::Transport("broken pipe".to_string()));
        }

        on_progress(total / 2, total);
        self.probe.sample();
        on_progress(total, total);
        self.log.push(format!("uploaded:{}", upload.remote_id));

        Ok(self
            .create_responses
            .get(&upload.remote_id)
            .cloned()
            .unwrap_or_else(|| created(&upload.remote_id)))
    }

    async fn submit_edit(
        &self,
        edit_action: &str,
        remote_id: &str,
        fields: &[(String, String)],
    ) -> Result<HostResponse, HostError> {
        self.edits
            .lock()
            .unwrap()
            .push((edit_action.to_string(), remote_id.to_string(), fields.to_vec()));
        match self.edit_responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(())) => Err(HostError::Transport("connection refused".to_string())),
            None => Ok(settled_response()),
        }
    }

    async fn delete_asset(&self, delete_action: &str) -> Result<HostResponse, HostError> {
        self.deletes.lock().unwrap().push(delete_action.to_string());
        match self.delete_responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(())) => Err(HostError::Transport("connection refused".to_string())),
            None => Ok(settled_response()),
        }
    }
}

/// One request as seen by `StubServer`
#[derive(Debug, Clone)]
pub struct StubRequest {
    pub method: String,
    /// Path and query as sent on the request line
    pub target: String,
    /// Header names lowercased
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StubRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    pub fn query(&self, key: &str) -> Option<String> {
        let url = url::Url::parse(&format!("http://stub{}", self.target)).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Value of a text field in a multipart body
    pub fn form_field(&self, name: &str) -> Option<String> {
        let body = String::from_utf8_lossy(&self.body);
        let marker = format!("name=\"{}\"", name);
        let start = body.find(&marker)? + marker.len();
        let value_start = body[start..].find("\r\n\r\n")? + start + 4;
        let value_end = body[value_start..].find("\r\n")? + value_start;
        Some(body[value_start..value_end].to_string())
    }

    pub fn has_form_field(&self, name: &str) -> bool {
        String::from_utf8_lossy(&self.body).contains(&format!("name=\"{}\"", name))
    }
}

type StubHandler = dyn Fn(&StubRequest) -> (u16, String) + Send + Sync;

/// Minimal HTTP/1.1 server on an ephemeral port. Answers every request with
/// whatever `respond` returns as a JSON body and closes the connection.
pub struct StubServer {
    pub base: String,
    requests: Arc<Mutex<Vec<StubRequest>>>,
}

impl StubServer {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&StubRequest) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let respond: Arc<StubHandler> = Arc::new(respond);

        let seen = requests.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let seen = seen.clone();
                let respond = respond.clone();
                tokio::spawn(async move {
                    let _ = serve_one(socket, respond.as_ref(), &seen).await;
                });
            }
        });
        Self { base, requests }
    }

    pub fn requests(&self) -> Vec<StubRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve_one(
    socket: tokio::net::TcpStream,
    respond: &StubHandler,
    seen: &Mutex<Vec<StubRequest>>,
) -> std::io::Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    let mut reader = BufReader::new(socket);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        reader.read_line(&mut line).await?;
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    let find = |name: &str| headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone());
    let mut body = Vec::new();
    if let Some(length) = find("content-length").and_then(|v| v.parse::<usize>().ok()) {
        body.resize(length, 0);
        reader.read_exact(&mut body).await?;
    } else if find("transfer-encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked")) {
        loop {
            line.clear();
            reader.read_line(&mut line).await?;
            let size = usize::from_str_radix(line.trim(), 16).unwrap_or(0);
            let mut chunk = vec![0; size + 2];
            reader.read_exact(&mut chunk).await?;
            if size == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..size]);
        }
    }

    let request = StubRequest { method, target, headers, body };
    let (status, payload) = respond(&request);
    seen.lock().unwrap().push(request);

    let response = format!(
        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        payload.len(),
        payload
    );
    let mut socket = reader.into_inner();
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}
