// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Status code reported for a handle that was never issued or has been cleaned up.
pub const STATUS_NOT_FOUND: i32 = -1;
/// Status code reported for a failed transfer. Use the error query for the reason.
pub const STATUS_FAILED: i32 = -2;
/// Status code reported once the download finished. Values `0..=99` mean
/// the transfer is pending or active and carry its whole-percent progress.
pub const STATUS_COMPLETED: i32 = 100;

/// Error text recorded when a transfer is abandoned through its cancellation token.
pub const ERROR_CANCELLED: &str = "cancelled";
/// Error text recorded for transfers that were still running when the previous
/// process exited.
pub const ERROR_INTERRUPTED: &str = "interrupted";

/// Lifecycle of a single transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Active,
    Completed,
    Failed(String), // Storing a reason for failure
}

impl TransferState {
    /// Completed and Failed accept no further updates.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed(_))
    }
}

/// What a status poll reports for a handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferStatus {
    NotFound,
    Pending,
    Active { progress: f32 },
    Completed,
    Failed,
}

impl TransferStatus {
    /// Stable integer encoding used across the C boundary.
    pub fn code(&self) -> i32 {
        match self {
            TransferStatus::NotFound => STATUS_NOT_FOUND,
            TransferStatus::Failed => STATUS_FAILED,
            TransferStatus::Pending => 0,
            // clamp 0-99 until the transport reports completion
            TransferStatus::Active { progress } => ((progress * 100.0).floor() as i32).clamp(0, 99),
            TransferStatus::Completed => STATUS_COMPLETED,
        }
    }
}

/// Represents the complete, persistent state of a single transfer.
/// This struct is serialized as JSON into the persistence store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Public handle; never reused.
    pub handle: u64,
    pub url: String,
    /// Where bytes land while the transfer runs.
    pub temp_location: PathBuf,
    /// Final path requested at start; may be overridden when the file is moved.
    pub destination: PathBuf,
    pub state: TransferState,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Set once the temp file has been moved to its destination.
    pub finalized: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn new(handle: u64, url: String, destination: PathBuf, temp_dir: &Path) -> Self {
        let now = Utc::now();
        Self {
            handle,
            url,
            temp_location: Self::temporary_path(temp_dir, handle),
            destination,
            state: TransferState::Pending,
            downloaded_bytes: 0,
            total_bytes: None,
            finalized: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the path of the temporary download file for `handle`,
    /// e.g. `<temp_dir>/42.part`.
    pub fn temporary_path(temp_dir: &Path, handle: u64) -> PathBuf {
        temp_dir.join(format!("{}.part", handle))
    }

    /// Calculates download progress as a fraction from 0.0 to 1.0.
    pub fn progress(&self) -> f32 {
        match self.state {
            TransferState::Completed => 1.0,
            _ => match self.total_bytes {
                Some(total) if total > 0 => {
                    (self.downloaded_bytes as f32 / total as f32).min(1.0)
                }
                _ => 0.0,
            },
        }
    }

    /// Whole-percent progress; persistence is keyed off changes to this value.
    pub fn percent(&self) -> u32 {
        (self.progress() * 100.0).floor() as u32
    }

    pub fn status(&self) -> TransferStatus {
        match &self.state {
            TransferState::Pending => TransferStatus::Pending,
            TransferState::Active => TransferStatus::Active {
                progress: self.progress(),
            },
            TransferState::Completed => TransferStatus::Completed,
            TransferState::Failed(_) => TransferStatus::Failed,
        }
    }

    /// The recorded failure reason, present only in the Failed state.
    pub fn error(&self) -> Option<&str> {
        match &self.state {
            TransferState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Applies a progress report. Ignored once terminal, and ignored when it
    /// would lower the reported fraction (e.g. a late, larger total).
    pub fn record_progress(&mut self, downloaded: u64, total: Option<u64>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let before = self.progress();
        let (old_downloaded, old_total) = (self.downloaded_bytes, self.total_bytes);
        self.downloaded_bytes = self.downloaded_bytes.max(downloaded);
        if total.is_some() {
            self.total_bytes = total;
        }
        if self.progress() < before {
            self.downloaded_bytes = old_downloaded;
            self.total_bytes = old_total;
            return false;
        }
        self.state = TransferState::Active;
        self.touch();
        true
    }

    pub fn mark_completed(&mut self, temp_location: PathBuf) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.temp_location = temp_location;
        if let Some(total) = self.total_bytes {
            self.downloaded_bytes = self.downloaded_bytes.max(total);
        }
        self.state = TransferState::Completed;
        self.touch();
        true
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let mut reason = reason.into();
        if reason.is_empty() {
            reason = "unknown error".to_string();
        }
        self.state = TransferState::Failed(reason);
        self.touch();
        true
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TransferRecord {
        TransferRecord::new(
            7,
            "http://example.com/a.zip".to_string(),
            PathBuf::from("/data/a.zip"),
            Path::new("/tmp/odm"),
        )
    }

    #[test]
    fn new_record_is_pending_with_private_temp_file() {
        let r = record();
        assert_eq!(r.state, TransferState::Pending);
        assert_eq!(r.temp_location, PathBuf::from("/tmp/odm/7.part"));
        assert_eq!(r.status().code(), 0);
        assert!(r.error().is_none());
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut r = record();
        r.record_progress(50, Some(100));
        r.record_progress(20, Some(100));
        assert_eq!(r.downloaded_bytes, 50);
        assert_eq!(r.status(), TransferStatus::Active { progress: 0.5 });
        assert_eq!(r.status().code(), 50);
    }

    #[test]
    fn larger_total_cannot_lower_progress() {
        let mut r = record();
        assert!(r.record_progress(50, Some(100)));
        assert!(!r.record_progress(60, Some(200)));
        assert_eq!(r.progress(), 0.5);
        assert_eq!(r.status().code(), 50);

        assert!(r.record_progress(150, Some(200)));
        assert_eq!(r.progress(), 0.75);
        assert_eq!(r.total_bytes, Some(200));
    }

    #[test]
    fn active_code_is_clamped_below_completed() {
        let mut r = record();
        r.record_progress(100, Some(100));
        assert_eq!(r.status().code(), 99);
        r.mark_completed(r.temp_location.clone());
        assert_eq!(r.status().code(), STATUS_COMPLETED);
        assert_eq!(r.progress(), 1.0);
    }

    #[test]
    fn terminal_states_reject_updates() {
        let mut r = record();
        assert!(r.mark_failed("http status 404"));
        assert!(!r.record_progress(10, Some(100)));
        assert!(!r.mark_completed(PathBuf::from("/tmp/x")));
        assert!(!r.mark_failed("again"));
        assert_eq!(r.error(), Some("http status 404"));
        assert_eq!(r.status().code(), STATUS_FAILED);
    }

    #[test]
    fn failure_reason_is_never_empty() {
        let mut r = record();
        r.mark_failed("");
        assert_eq!(r.error(), Some("unknown error"));
    }

    #[test]
    fn unknown_total_reports_zero_progress() {
        let mut r = record();
        r.record_progress(4096, None);
        assert_eq!(r.progress(), 0.0);
        assert_eq!(r.status().code(), 0);
    }

    #[test]
    fn record_survives_json() {
        let mut r = record();
        r.mark_failed(ERROR_CANCELLED);
        let json = serde_json::to_string(&r).unwrap();
        let back: TransferRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.handle, 7);
        assert_eq!(back.error(), Some(ERROR_CANCELLED));
    }
}
