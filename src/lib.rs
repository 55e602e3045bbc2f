pub mod config;
pub mod downloader;
pub mod ffi;
pub mod integrity;
pub mod manager;
pub mod models;
pub mod state_manager;

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. `RUST_LOG` wins over
/// `default_filter`. Does nothing if a subscriber is already set.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::DownloaderConfig;
    pub use crate::downloader::{HttpTransport, Notifier, TaskId, TransferEvent, Transport};
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{TransferRecord, TransferState, TransferStatus};
    pub use crate::state_manager::StateManager;
}
