// src/manager.rs

use crate::config::{ConfigError, DownloaderConfig};
use crate::downloader::{
    validate_url, DownloadError, FetchRequest, HttpTransport, Notifier, TaskId, TransferEvent,
    Transport,
};
use crate::integrity::{verify_sha256, IntegrityError};
use crate::models::{TransferRecord, TransferState, TransferStatus, ERROR_INTERRUPTED};
use crate::state_manager::{StateError, StateManager};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("transport error: {0}")]
    Transport(#[from] DownloadError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    #[error("transfer with handle {0} not found")]
    JobNotFound(u64),
    #[error("transfer {0} has not completed")]
    NotCompleted(u64),
    #[error("temporary file for transfer {0} is missing")]
    MissingTempFile(u64),
}

/// Mutation-side bookkeeping. Only touched while the mutation lock is held.
#[derive(Default)]
struct Bookkeeping {
    /// Transport task id -> public handle.
    tasks: HashMap<TaskId, u64>,
    cancellation_tokens: HashMap<u64, CancellationToken>,
    /// Last whole-percent value written to the store, per handle.
    persisted_percent: HashMap<u64, u32>,
}

struct Core {
    state_manager: StateManager,
    transport: Arc<dyn Transport>,
    temp_dir: PathBuf,
    records: RwLock<HashMap<u64, TransferRecord>>,
    // Serializes every mutation together with its write to the store.
    // Status reads only take the `records` lock, which is never held across I/O.
    mutation: Mutex<Bookkeeping>,
    next_handle: AtomicU64,
    notifier: Notifier,
    /// Parent of every transfer's cancellation token.
    shutdown: CancellationToken,
}

/// The central component that owns every transfer record and its lifecycle.
///
/// All public operations return quickly: none of them waits on the network.
/// Transport notifications are applied by a background dispatcher task that
/// lives as long as the manager.
pub struct DownloadManager {
    core: Arc<Core>,
    dispatcher: JoinHandle<()>,
}

impl DownloadManager {
    /// Must be called from within a tokio runtime.
    pub async fn new(
        state_manager: StateManager,
        transport: Arc<dyn Transport>,
        temp_dir: PathBuf,
    ) -> Result<Self, ManagerError> {
        tokio::fs::create_dir_all(&temp_dir).await?;
        let next_handle = state_manager.next_handle().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let core = Arc::new(Core {
            state_manager,
            transport,
            temp_dir,
            records: RwLock::new(HashMap::new()),
            mutation: Mutex::new(Bookkeeping::default()),
            next_handle: AtomicU64::new(next_handle),
            notifier: Notifier::new(tx),
            shutdown: CancellationToken::new(),
        });

        core.sweep_orphaned_temp_files().await;
        let dispatcher = tokio::spawn(Self::dispatch(core.clone(), rx));

        info!("Manager: ready, next handle {}.", next_handle);
        Ok(Self { core, dispatcher })
    }

    /// Opens the on-disk store described by `config` and an HTTP transport.
    pub async fn open(config: &DownloaderConfig) -> Result<Self, ManagerError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let state_manager = StateManager::new(&config.db_path()).await?;
        let transport = Arc::new(HttpTransport::new(config.http_options())?);
        Self::new(state_manager, transport, config.resolved_temp_dir()).await
    }

    async fn dispatch(core: Arc<Core>, mut rx: UnboundedReceiver<(TaskId, TransferEvent)>) {
        while let Some((task, event)) = rx.recv().await {
            core.apply_event(task, event).await;
        }
    }

    /// Starts a download of `url`, to be moved to `destination` once finished.
    /// Returns the new handle without waiting for any network activity.
    pub async fn start(&self, url: &str, destination: impl AsRef<Path>) -> Result<u64, ManagerError> {
        let url = validate_url(url).map_err(|e| ManagerError::InvalidUrl(e.to_string()))?;
        let destination = destination.as_ref();
        if destination.as_os_str().is_empty() {
            return Err(ManagerError::InvalidDestination("empty destination".to_string()));
        }

        let core = &self.core;
        let mut book = core.mutation.lock().await;

        let handle = core.next_handle.fetch_add(1, Ordering::SeqCst);
        let mut record = TransferRecord::new(
            handle,
            url.to_string(),
            destination.to_path_buf(),
            &core.temp_dir,
        );

        let cancel = core.shutdown.child_token();
        let request = FetchRequest {
            url,
            temp_path: record.temp_location.clone(),
            cancel: cancel.clone(),
        };
        let task = match core.transport.submit(request, core.notifier.clone()) {
            Ok(task) => {
                record.state = TransferState::Active;
                record.touch();
                Some(task)
            }
            Err(e) => {
                warn!("Manager: transport rejected transfer {}: {}", handle, e);
                record.mark_failed(e.to_string());
                None
            }
        };

        if let Err(e) = core.state_manager.save_new_record(&record, handle + 1).await {
            cancel.cancel();
            error!("Manager: could not persist new transfer {}: {}", handle, e);
            return Err(e.into());
        }

        if let Some(task) = task {
            book.tasks.insert(task, handle);
            book.cancellation_tokens.insert(handle, cancel);
            book.persisted_percent.insert(handle, 0);
        }
        core.records.write().await.insert(handle, record);

        info!("Manager: started transfer {} for {}.", handle, destination.display());
        Ok(handle)
    }

    /// A snapshot of the record for `handle`, rehydrating it from the store
    /// if this process has not seen it yet.
    pub async fn record(&self, handle: u64) -> Option<TransferRecord> {
        if let Some(record) = self.core.records.read().await.get(&handle) {
            return Some(record.clone());
        }
        self.core.rehydrate(handle).await
    }

    pub async fn status(&self, handle: u64) -> TransferStatus {
        self.record(handle)
            .await
            .map_or(TransferStatus::NotFound, |r| r.status())
    }

    /// Progress fraction for pending, active and completed transfers.
    pub async fn progress(&self, handle: u64) -> Option<f32> {
        self.record(handle).await.and_then(|r| match r.state {
            TransferState::Failed(_) => None,
            _ => Some(r.progress()),
        })
    }

    /// The recorded error, or an empty string if there is none or the handle is unknown.
    pub async fn error(&self, handle: u64) -> String {
        self.record(handle)
            .await
            .and_then(|r| r.error().map(str::to_string))
            .unwrap_or_default()
    }

    /// Handles currently held in memory, ascending.
    pub async fn handles(&self) -> Vec<u64> {
        let mut handles: Vec<u64> = self.core.records.read().await.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Moves the finished download to `destination` (or, if that is empty, to
    /// the destination given at start). Returns false and leaves both paths
    /// untouched on any failure.
    pub async fn move_file(&self, handle: u64, destination: impl AsRef<Path>) -> bool {
        match self.try_move_file(handle, destination).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Manager: move for transfer {} failed: {}", handle, e);
                false
            }
        }
    }

    /// Like [`move_file`](Self::move_file), with the reason on failure.
    ///
    /// The file is in place once this returns `Ok`, even if recording the move
    /// in the store failed. A record reloaded after such a failure is
    /// recognised as moved when its temp file is gone and its destination exists.
    pub async fn try_move_file(
        &self,
        handle: u64,
        destination: impl AsRef<Path>,
    ) -> Result<PathBuf, ManagerError> {
        let core = &self.core;
        let _book = core.mutation.lock().await;

        let record = core
            .load_locked(handle)
            .await
            .ok_or(ManagerError::JobNotFound(handle))?;
        if record.state != TransferState::Completed {
            return Err(ManagerError::NotCompleted(handle));
        }

        let destination = destination.as_ref();
        let destination = if destination.as_os_str().is_empty() {
            record.destination.clone()
        } else {
            destination.to_path_buf()
        };
        if destination.as_os_str().is_empty() {
            return Err(ManagerError::InvalidDestination("empty destination".to_string()));
        }

        match tokio::fs::metadata(&record.temp_location).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(ManagerError::MissingTempFile(handle)),
        }

        finalize_file(&record.temp_location, &destination).await?;

        let updated = {
            let mut records = core.records.write().await;
            records.get_mut(&handle).map(|r| {
                r.finalized = true;
                r.destination = destination.clone();
                r.touch();
                r.clone()
            })
        };
        if let Some(record) = updated {
            if let Err(e) = core.state_manager.save_record(&record).await {
                warn!("Manager: moved transfer {} but could not persist it: {}", handle, e);
            }
        }

        info!("Manager: moved transfer {} to {}.", handle, destination.display());
        Ok(destination)
    }

    /// Forgets `handle`: cancels its fetch if still running, deletes the temp
    /// file and drops the record from memory and the store. Unknown handles
    /// and repeated calls are no-ops.
    pub async fn cleanup(&self, handle: u64) {
        let core = &self.core;
        let mut book = core.mutation.lock().await;

        if let Some(token) = book.cancellation_tokens.remove(&handle) {
            token.cancel();
        }
        book.tasks.retain(|_, h| *h != handle);
        book.persisted_percent.remove(&handle);

        let removed = core.records.write().await.remove(&handle);
        let record = match removed {
            Some(record) => Some(record),
            None if core.may_be_persisted(handle) => {
                match core.state_manager.load_record(handle).await {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Manager: could not read transfer {} during cleanup: {}", handle, e);
                        None
                    }
                }
            }
            None => None,
        };

        let Some(record) = record else {
            debug!("Manager: nothing to clean up for transfer {}.", handle);
            return;
        };

        remove_if_present(&record.temp_location).await;
        if let Err(e) = core.state_manager.delete_record(handle).await {
            warn!("Manager: could not delete transfer {} from the database: {}", handle, e);
        }
        info!("Manager: removed transfer {}.", handle);
    }

    /// Same as [`cleanup`](Self::cleanup).
    pub async fn remove_file(&self, handle: u64) {
        self.cleanup(handle).await
    }

    /// Removes finished or failed transfers, and transfers orphaned by a
    /// previous process, that have not changed for `max_age`. Returns how many
    /// were removed.
    pub async fn cleanup_stale(&self, max_age: chrono::Duration) -> Result<usize, ManagerError> {
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return Ok(0);
        };

        let in_memory: HashMap<u64, bool> = {
            let records = self.core.records.read().await;
            records
                .values()
                .map(|r| (r.handle, r.state.is_terminal() && r.updated_at < cutoff))
                .collect()
        };

        let mut stale: HashSet<u64> = in_memory
            .iter()
            .filter(|(_, is_stale)| **is_stale)
            .map(|(handle, _)| *handle)
            .collect();
        for record in self.core.state_manager.load_all_records().await? {
            if !in_memory.contains_key(&record.handle) && record.updated_at < cutoff {
                stale.insert(record.handle);
            }
        }

        for handle in &stale {
            self.cleanup(*handle).await;
        }
        if !stale.is_empty() {
            info!("Manager: pruned {} stale transfers.", stale.len());
        }
        Ok(stale.len())
    }

    /// Checks the downloaded bytes of a completed transfer against a SHA-256
    /// hex digest. Hashes the destination once the file has been moved.
    pub async fn verify_file(&self, handle: u64, expected_sha256: &str) -> Result<bool, ManagerError> {
        let record = self
            .record(handle)
            .await
            .ok_or(ManagerError::JobNotFound(handle))?;
        if record.state != TransferState::Completed {
            return Err(ManagerError::NotCompleted(handle));
        }
        let path = if record.finalized {
            &record.destination
        } else {
            &record.temp_location
        };
        Ok(verify_sha256(path, expected_sha256).await?)
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.core.shutdown.cancel();
    }
}

impl Core {
    /// Handles below the counter may exist in the store from an earlier run.
    fn may_be_persisted(&self, handle: u64) -> bool {
        handle != 0 && handle < self.next_handle.load(Ordering::SeqCst)
    }

    async fn apply_event(&self, task: TaskId, event: TransferEvent) {
        let mut book = self.mutation.lock().await;
        let Some(&handle) = book.tasks.get(&task) else {
            debug!("Manager: dropping event for unknown task {}.", task);
            return;
        };

        let terminal = !matches!(event, TransferEvent::Progress { .. });
        if terminal {
            book.tasks.remove(&task);
            book.cancellation_tokens.remove(&handle);
        }

        let updated = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(&handle) else {
                return;
            };
            let changed = match event {
                TransferEvent::Progress { downloaded, total } => {
                    record.record_progress(downloaded, total)
                }
                TransferEvent::Failed(reason) => record.mark_failed(reason),
                TransferEvent::Completed(path) => record.mark_completed(path),
            };
            changed.then(|| record.clone())
        };
        let Some(record) = updated else {
            return;
        };

        if terminal {
            book.persisted_percent.remove(&handle);
            match &record.state {
                TransferState::Failed(reason) => {
                    warn!("Manager: transfer {} failed: {}", handle, reason)
                }
                _ => info!("Manager: transfer {} completed.", handle),
            }
        } else {
            let percent = record.percent();
            if book.persisted_percent.get(&handle) == Some(&percent) {
                return;
            }
            book.persisted_percent.insert(handle, percent);
            debug!("Manager: transfer {} at {}%.", handle, percent);
        }

        if let Err(e) = self.state_manager.save_record(&record).await {
            error!("Manager: failed to save state for transfer {}: {}", handle, e);
        }
    }

    async fn rehydrate(&self, handle: u64) -> Option<TransferRecord> {
        if !self.may_be_persisted(handle) {
            return None;
        }
        let _book = self.mutation.lock().await;
        self.load_locked(handle).await
    }

    /// Memory first, then the store. Caller holds the mutation lock.
    async fn load_locked(&self, handle: u64) -> Option<TransferRecord> {
        if let Some(record) = self.records.read().await.get(&handle) {
            return Some(record.clone());
        }
        if !self.may_be_persisted(handle) {
            return None;
        }

        let mut record = match self.state_manager.load_record(handle).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!("Manager: could not load transfer {}: {}", handle, e);
                return None;
            }
        };

        let repaired = if !record.state.is_terminal() {
            // Its fetch died with the previous process.
            record.mark_failed(ERROR_INTERRUPTED)
        } else {
            let moved = record.state == TransferState::Completed
                && !record.finalized
                && !path_exists(&record.temp_location).await
                && path_exists(&record.destination).await;
            if moved {
                record.finalized = true;
                record.touch();
            }
            moved
        };
        if repaired {
            if let Err(e) = self.state_manager.save_record(&record).await {
                warn!("Manager: could not save repaired transfer {}: {}", handle, e);
            }
        }

        debug!("Manager: rehydrated transfer {} from the database.", handle);
        self.records.write().await.insert(handle, record.clone());
        Some(record)
    }

    /// Deletes `<n>.part` files left behind by transfers the store no longer knows.
    async fn sweep_orphaned_temp_files(&self) {
        let known: HashSet<u64> = match self.state_manager.load_handles().await {
            Ok(handles) => handles.into_iter().collect(),
            Err(e) => {
                warn!("Manager: skipping temp sweep: {}", e);
                return;
            }
        };

        let mut entries = match tokio::fs::read_dir(&self.temp_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Manager: cannot read {}: {}", self.temp_dir.display(), e);
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(handle) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".part"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            if !known.contains(&handle) {
                debug!("Manager: removing orphaned {}.", entry.path().display());
                remove_if_present(&entry.path()).await;
            }
        }
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Manager: could not remove {}: {}", path.display(), e);
        }
    }
}

/// Moves `src` to `dest`, creating parent directories. Falls back to copying
/// into a staging file next to `dest` when a rename would cross filesystems,
/// so `dest` is either complete or untouched.
async fn finalize_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    let created = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            let missing = missing_ancestors(parent).await;
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                remove_created_dirs(&missing).await;
                return Err(e);
            }
            missing
        }
        _ => Vec::new(),
    };

    let result = match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => copy_then_rename(src, dest).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        remove_created_dirs(&created).await;
    }
    result
}

/// Ancestors of `dir` (itself included) that do not exist yet, deepest first.
async fn missing_ancestors(dir: &Path) -> Vec<PathBuf> {
    let mut missing = Vec::new();
    let mut current = Some(dir);
    while let Some(path) = current {
        if path.as_os_str().is_empty() || tokio::fs::try_exists(path).await.unwrap_or(true) {
            break;
        }
        missing.push(path.to_path_buf());
        current = path.parent();
    }
    missing
}

async fn remove_created_dirs(deepest_first: &[PathBuf]) {
    for dir in deepest_first {
        if let Err(e) = tokio::fs::remove_dir(dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Manager: could not remove {}: {}", dir.display(), e);
            }
        }
    }
}

async fn copy_then_rename(src: &Path, dest: &Path) -> std::io::Result<()> {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    let staging = dest.with_file_name(format!(".{}.odm-move", file_name));

    let staged = async {
        tokio::fs::copy(src, &staging).await?;
        tokio::fs::File::open(&staging).await?.sync_all().await?;
        tokio::fs::rename(&staging, dest).await
    }
    .await;
    if let Err(e) = staged {
        remove_if_present(&staging).await;
        return Err(e);
    }

    remove_if_present(src).await;
    Ok(())
}
