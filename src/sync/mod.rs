//! Resumable remote sync of a committed run directory.
//!
//! The client uploads the manifest outputs in chunks through a [`RemoteStore`],
//! persisting [`SyncState`] after every transition and every file so an
//! interrupted attempt resumes where it stopped. Runs that cannot sync now land
//! in the [`SyncQueue`].

pub mod client;
pub mod queue;
pub mod repair;
pub mod state;
pub mod transport;

use thiserror::Error;

use crate::error::{classify_error, ErrorCategory};
use crate::file_lock::LockError;
use crate::preflight::auth::AuthError;

pub use client::{SyncClient, SyncOutcome};
pub use queue::{retry_queue, SyncQueue, SyncQueueItem};
pub use repair::{repair_duplicate_folders, repair_run_destination, RepairReport};
pub use state::{SyncState, SyncStateKind};
pub use transport::{HttpRemoteStore, MockRemoteStore, RemoteStore};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("remote unreachable: {0}")]
    Connection(String),

    #[error("remote returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("duplicate_remote_folder: {count} folders named {name:?} under {parent_id}")]
    DuplicateRemoteFolder {
        parent_id: String,
        name: String,
        count: usize,
    },

    #[error("permissions_public_link_detected: folder {folder_id} is shared with anyone")]
    PublicLinkDetected { folder_id: String },

    #[error("local hash mismatch for {path}: manifest {expected}, file {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("remote verification failed for {path}: {detail}")]
    Verification { path: String, detail: String },

    #[error("upload of {path} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        path: String,
        attempts: u32,
        last: Box<SyncError>,
    },

    #[error("manifest.json missing or unreadable")]
    ManifestMissing,

    #[error("remote store not configured")]
    NoRemote,
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) | Self::Lock(_) | Self::HashMismatch { .. } | Self::ManifestMissing => {
                ErrorCategory::Io
            }
            Self::Json(_) => ErrorCategory::Parser,
            Self::Auth(e) => e.category(),
            Self::Connection(_) => ErrorCategory::Network,
            Self::Http { status, body } => match status {
                401 | 403 => ErrorCategory::Auth,
                429 | 507 => ErrorCategory::Quota,
                408 | 500..=599 => ErrorCategory::Network,
                _ => classify_error(body),
            },
            Self::PublicLinkDetected { .. } => ErrorCategory::Auth,
            Self::RetriesExhausted { last, .. } => last.category(),
            Self::DuplicateRemoteFolder { .. }
            | Self::Protocol(_)
            | Self::Verification { .. }
            | Self::NoRemote => ErrorCategory::Unknown,
        }
    }

    /// Retrying cannot fix this; someone has to act first.
    pub fn human_action_required(&self) -> bool {
        match self {
            Self::DuplicateRemoteFolder { .. } | Self::PublicLinkDetected { .. } => true,
            Self::RetriesExhausted { last, .. } => last.human_action_required(),
            other => other.category() == ErrorCategory::Auth,
        }
    }

    /// Worth another attempt after backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Http { status, .. } => matches!(status, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}
