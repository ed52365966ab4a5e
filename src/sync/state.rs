//! Persisted sync state machine (`sync_state.json`).

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::{self, SCHEMA_VERSION, SYNC_STATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStateKind {
    NotStarted,
    Pending,
    Uploading,
    Verifying,
    Committed,
    Failed,
    Deferred,
}

impl SyncStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Verifying => "verifying",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
        }
    }
}

impl std::fmt::Display for SyncStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file the remote has seen, possibly only partially.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub path: String,
    pub size: u64,
    pub sha256: String,
    pub md5: String,
    /// Set once the final chunk is accepted.
    pub file_id: Option<String>,
    /// Resumable session; kept so an interrupted upload continues at its offset.
    pub session_uri: Option<String>,
    pub verified: bool,
    pub attempts: u32,
}

impl UploadedFile {
    /// Fully uploaded and matching the given local hash.
    pub fn is_complete_for(&self, sha256: &str) -> bool {
        self.file_id.is_some() && self.sha256 == sha256
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub path: String,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub schema_version: String,
    pub run_id: String,
    pub state: SyncStateKind,
    pub uploaded_files: Vec<UploadedFile>,
    pub pending_files: Vec<String>,
    pub failed_files: Vec<FailedFile>,
    pub retries: u32,
    pub resume_count: u32,
    pub last_error: Option<String>,
    #[serde(default)]
    pub remote_root_folder_id: Option<String>,
    #[serde(default)]
    pub remote_run_folder_id: Option<String>,
    pub warnings: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    pub fn new(run_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run_id.to_string(),
            state: SyncStateKind::NotStarted,
            uploaded_files: Vec::new(),
            pending_files: Vec::new(),
            failed_files: Vec::new(),
            retries: 0,
            resume_count: 0,
            last_error: None,
            remote_root_folder_id: None,
            remote_run_folder_id: None,
            warnings: Vec::new(),
            updated_at: now,
        }
    }

    /// Existing state for the run, if readable.
    pub fn load(run_dir: &Path) -> Option<Self> {
        artifacts::read_json_opt(&run_dir.join(SYNC_STATE))
    }

    pub fn load_or_new(run_dir: &Path, run_id: &str, now: DateTime<Utc>) -> Self {
        Self::load(run_dir).unwrap_or_else(|| Self::new(run_id, now))
    }

    pub fn save(&mut self, run_dir: &Path, now: DateTime<Utc>) -> std::io::Result<()> {
        self.updated_at = now;
        artifacts::write_json_atomic(&run_dir.join(SYNC_STATE), self)
    }

    pub fn transition(&mut self, next: SyncStateKind) {
        if self.state != next {
            tracing::info!(run_id = %self.run_id, from = %self.state, to = %next, "Sync state");
            self.state = next;
        }
    }

    /// An earlier attempt left work behind.
    pub fn has_progress(&self) -> bool {
        !self.uploaded_files.is_empty() || !self.failed_files.is_empty() || !self.pending_files.is_empty()
    }

    /// Whether starting an attempt from this state counts as a resume.
    pub fn is_resumable(&self) -> bool {
        !matches!(self.state, SyncStateKind::NotStarted | SyncStateKind::Committed)
            && self.has_progress()
    }

    pub fn record(&self, path: &str) -> Option<&UploadedFile> {
        self.uploaded_files.iter().find(|f| f.path == path)
    }

    /// Insert or replace the record for `file.path`.
    pub fn upsert_record(&mut self, file: UploadedFile) {
        match self.uploaded_files.iter_mut().find(|f| f.path == file.path) {
            Some(existing) => *existing = file,
            None => self.uploaded_files.push(file),
        }
    }

    pub fn mark_failed_file(&mut self, path: &str, attempts: u32, error: &str) {
        self.failed_files.retain(|f| f.path != path);
        self.failed_files.push(FailedFile {
            path: path.to_string(),
            attempts,
            error: error.to_string(),
        });
    }

    pub fn clear_failed_file(&mut self, path: &str) {
        self.failed_files.retain(|f| f.path != path);
    }

    pub fn add_warning(&mut self, warning: String) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }
}
