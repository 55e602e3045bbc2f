use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use reqwest::{Client, Url};
use thiserror::Error;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::models::ERROR_CANCELLED;

/// Identifier a transport assigns to each submitted fetch.
pub type TaskId = u64;

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("{}", ERROR_CANCELLED)]
    Cancelled,
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Checks that `raw` is an absolute http(s) URL.
pub fn validate_url(raw: &str) -> Result<Url, DownloadError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DownloadError::InvalidUrl("empty url".to_string()));
    }
    let url = Url::parse(trimmed).map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(DownloadError::InvalidUrl(format!("unsupported scheme {}", other))),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(DownloadError::InvalidUrl("missing host".to_string()));
    }
    Ok(url)
}

/// A notification from the transport about one of its tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress { downloaded: u64, total: Option<u64> },
    Failed(String),
    Completed(PathBuf),
}

/// The channel through which a transport reports back to the coordinator.
/// Sending never blocks; reports for a closed coordinator are dropped.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: UnboundedSender<(TaskId, TransferEvent)>,
}

impl Notifier {
    pub fn new(tx: UnboundedSender<(TaskId, TransferEvent)>) -> Self {
        Self { tx }
    }

    pub fn progress(&self, task: TaskId, downloaded: u64, total: Option<u64>) {
        self.send(task, TransferEvent::Progress { downloaded, total });
    }

    pub fn failure(&self, task: TaskId, reason: impl Into<String>) {
        self.send(task, TransferEvent::Failed(reason.into()));
    }

    pub fn completion(&self, task: TaskId, temp_path: PathBuf) {
        self.send(task, TransferEvent::Completed(temp_path));
    }

    fn send(&self, task: TaskId, event: TransferEvent) {
        if self.tx.send((task, event)).is_err() {
            debug!("dropping event for task {}: coordinator closed", task);
        }
    }
}

/// One fetch handed to a transport.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    /// File the transport writes into; owned by this request alone.
    pub temp_path: PathBuf,
    /// Cancelled when the coordinator abandons the transfer.
    pub cancel: CancellationToken,
}

/// The asynchronous fetch facility the coordinator depends on.
///
/// `submit` must return promptly: the fetch itself runs in the background and
/// reports through `notifier`, using the returned task id. An `Err` means the
/// request was never accepted and no notification will follow.
pub trait Transport: Send + Sync {
    fn submit(&self, request: FetchRequest, notifier: Notifier) -> Result<TaskId, DownloadError>;
}

/// Options for the HTTP session.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Honour HTTP(S)_PROXY and friends from the environment.
    pub system_proxy: bool,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            user_agent: concat!("odm-embed/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(30),
            system_proxy: true,
        }
    }
}

/// reqwest-backed transport. One `Client` (and its connection pool) is
/// shared by every transfer.
#[derive(Debug)]
pub struct HttpTransport {
    client: Client,
    next_task: AtomicU64,
}

impl HttpTransport {
    pub fn new(options: HttpOptions) -> Result<Self, DownloadError> {
        let mut builder = Client::builder()
            .user_agent(options.user_agent)
            .connect_timeout(options.connect_timeout);
        if !options.system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            next_task: AtomicU64::new(1),
        }
    }
}

impl Transport for HttpTransport {
    fn submit(&self, request: FetchRequest, notifier: Notifier) -> Result<TaskId, DownloadError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DownloadError::Unavailable(e.to_string()))?;
        let task = self.next_task.fetch_add(1, Ordering::SeqCst);
        let client = self.client.clone();

        runtime.spawn(async move {
            let temp_path = request.temp_path.clone();
            let cancel = request.cancel.clone();
            let result = tokio::select! {
                r = fetch_to_file(&client, &request, task, &notifier) => r,
                _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            };

            match result {
                Ok(bytes) => {
                    info!("task {} finished: {} bytes into {}", task, bytes, temp_path.display());
                    notifier.completion(task, temp_path);
                }
                Err(e) => {
                    warn!("task {} failed: {}", task, e);
                    if let Err(rm) = tokio::fs::remove_file(&temp_path).await {
                        if rm.kind() != std::io::ErrorKind::NotFound {
                            warn!("could not remove partial file {}: {}", temp_path.display(), rm);
                        }
                    }
                    notifier.failure(task, e.to_string());
                }
            }
        });

        Ok(task)
    }
}

/// Streams the response body into the request's temp file, reporting progress per chunk.
async fn fetch_to_file(
    client: &Client,
    request: &FetchRequest,
    task: TaskId,
    notifier: &Notifier,
) -> Result<u64, DownloadError> {
    let resp = client.get(request.url.clone()).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(DownloadError::HttpStatus(status.as_u16()));
    }
    let total = resp.content_length();

    if let Some(parent) = request.temp_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = File::create(&request.temp_path).await?;
    notifier.progress(task, 0, total);

    let mut downloaded = 0u64;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let bytes = chunk?;
        file.write_all(&bytes).await?;
        downloaded += bytes.len() as u64;
        notifier.progress(task, downloaded, total);
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok(downloaded)
}
