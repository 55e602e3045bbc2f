//! Shared helpers for integration tests

#![allow(dead_code)]

use odm_embed::downloader::{DownloadError, FetchRequest, Notifier, TaskId, Transport};
use odm_embed::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub struct Submitted {
    pub task: TaskId,
    pub request: FetchRequest,
    pub notifier: Notifier,
}

/// A transport that never touches the network. Tests decide when each
/// submitted fetch reports progress, fails or completes.
#[derive(Default)]
pub struct ManualTransport {
    next_task: AtomicU64,
    reject: AtomicBool,
    submitted: Mutex<Vec<Submitted>>,
}

impl ManualTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reject_submissions(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> FetchRequest {
        self.submitted.lock().unwrap()[index].request.clone()
    }

    pub fn progress(&self, index: usize, downloaded: u64, total: Option<u64>) {
        let submitted = self.submitted.lock().unwrap();
        let s = &submitted[index];
        s.notifier.progress(s.task, downloaded, total);
    }

    pub fn fail(&self, index: usize, reason: &str) {
        let submitted = self.submitted.lock().unwrap();
        let s = &submitted[index];
        s.notifier.failure(s.task, reason);
    }

    /// Writes `body` to the request's temp file and reports completion.
    pub fn complete(&self, index: usize, body: &[u8]) {
        let submitted = self.submitted.lock().unwrap();
        let s = &submitted[index];
        if let Some(parent) = s.request.temp_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&s.request.temp_path, body).unwrap();
        let len = body.len() as u64;
        s.notifier.progress(s.task, len, Some(len));
        s.notifier.completion(s.task, s.request.temp_path.clone());
    }
}

impl Transport for ManualTransport {
    fn submit(&self, request: FetchRequest, notifier: Notifier) -> Result<TaskId, DownloadError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(DownloadError::Unavailable("offline".to_string()));
        }
        let task = self.next_task.fetch_add(1, Ordering::SeqCst) + 100;
        self.submitted.lock().unwrap().push(Submitted {
            task,
            request,
            notifier,
        });
        Ok(task)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub transport: Arc<ManualTransport>,
    pub manager: DownloadManager,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        Self::in_dir(dir).await
    }

    pub async fn in_dir(dir: TempDir) -> Self {
        let transport = ManualTransport::new();
        let manager = open_manager(&dir, transport.clone()).await;
        Self {
            dir,
            transport,
            manager,
        }
    }

    /// Drops the manager and opens a fresh one on the same directory,
    /// as a restarted process would.
    pub async fn restart(self) -> Self {
        let Harness { dir, manager, .. } = self;
        drop(manager);
        Self::in_dir(dir).await
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.path().join("tmp")
    }
}

pub async fn open_manager(dir: &TempDir, transport: Arc<ManualTransport>) -> DownloadManager {
    let store = StateManager::new(&dir.path().join("downloads.db"))
        .await
        .expect("open store");
    DownloadManager::new(store, transport, dir.path().join("tmp"))
        .await
        .expect("open manager")
}

/// Polls until `pred` holds for the handle's status, or panics after ~5s.
pub async fn wait_for<F>(manager: &DownloadManager, handle: u64, pred: F) -> TransferStatus
where
    F: Fn(&TransferStatus) -> bool,
{
    for _ in 0..500 {
        let status = manager.status(handle).await;
        if pred(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "handle {} never reached the expected status, last: {:?}",
        handle,
        manager.status(handle).await
    );
}

/// Waits until the dispatcher has applied a progress value of at least `min`.
pub async fn wait_for_progress(manager: &DownloadManager, handle: u64, min: f32) {
    wait_for(manager, handle, |s| match s {
        TransferStatus::Active { progress } => *progress >= min,
        TransferStatus::Completed => true,
        _ => false,
    })
    .await;
}
