//! Sync protocol for one run directory.
//!
//! ```text
//! load state ─► pending ─► lock ─► verify local hashes ─► resolve folders
//!     ─► draft manifest ─► uploading ─► verifying ─► final manifest ─► committed
//! ```
//! Any error lands in `failed` with the offending file recorded and the run
//! queued. A held lock defers the run without touching the network.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use super::queue::SyncQueue;
use super::state::{SyncState, SyncStateKind, UploadedFile};
use super::transport::{ChunkStatus, RemoteStore};
use super::SyncError;
use crate::artifacts::{self, Manifest, MANIFEST};
use crate::context::{Clock, OpsContext};
use crate::error::ErrorCategory;
use crate::file_lock::{FileLock, LockError, LockOptions};
use crate::hashing;
use crate::redact::redact_secrets;
use crate::worker_pool::WorkerPool;

/// Advisory lock guarding a run's sync state.
pub const SYNC_LOCK: &str = ".sync.lock";

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub run_id: String,
    pub state: SyncStateKind,
    /// Files uploaded during this attempt.
    pub uploaded: Vec<String>,
    /// Files already on the remote and unchanged.
    pub skipped: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub category: Option<ErrorCategory>,
    pub human_action_required: bool,
    pub resumed: bool,
}

impl SyncOutcome {
    fn new(run_id: &str, state: SyncStateKind) -> Self {
        Self {
            run_id: run_id.to_string(),
            state,
            uploaded: Vec::new(),
            skipped: Vec::new(),
            warnings: Vec::new(),
            error: None,
            category: None,
            human_action_required: false,
            resumed: false,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.state == SyncStateKind::Committed
    }
}

/// A manifest output checked against its declared hash.
#[derive(Debug, Clone)]
struct LocalFile {
    /// Relative to the run directory, `/`-separated.
    path: String,
    abs_path: PathBuf,
    size: u64,
    sha256: String,
    md5: String,
}

impl LocalFile {
    fn subdirs(&self) -> Vec<&str> {
        let mut parts: Vec<&str> = self.path.split('/').collect();
        parts.pop();
        parts
    }
}

fn verify_local_files(run_dir: &Path, manifest: &Manifest) -> Result<Vec<LocalFile>, SyncError> {
    manifest
        .outputs
        .iter()
        .map(|entry| {
            let abs_path = run_dir.join(&entry.path);
            let digest = hashing::digest_file(&abs_path)?;
            if digest.sha256 != entry.sha256 {
                return Err(SyncError::HashMismatch {
                    path: entry.path.clone(),
                    expected: entry.sha256.clone(),
                    actual: digest.sha256,
                });
            }
            Ok(LocalFile {
                path: entry.path.clone(),
                abs_path,
                size: digest.size,
                sha256: digest.sha256,
                md5: digest.md5,
            })
        })
        .collect()
}

/// Folder id for `name` under `parent_id`, creating it when absent.
/// Two or more same-name folders are an error.
pub(crate) fn resolve_folder(
    remote: &dyn RemoteStore,
    parent_id: &str,
    name: &str,
) -> Result<String, SyncError> {
    let matches: Vec<_> = remote
        .list_children(parent_id)?
        .into_iter()
        .filter(|e| e.is_folder && e.name == name)
        .collect();
    match matches.as_slice() {
        [] => Ok(remote.ensure_folder(parent_id, name)?.id),
        [only] => Ok(only.id.clone()),
        many => Err(SyncError::DuplicateRemoteFolder {
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            count: many.len(),
        }),
    }
}

// ═══════════════════════════════════════════════════════════
// Chunked upload with retries
// ═══════════════════════════════════════════════════════════

#[derive(Clone)]
struct Uploader {
    remote: Arc<dyn RemoteStore>,
    chunk_size: usize,
    max_retries: u32,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl Uploader {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.backoff_base_ms
                .saturating_mul(factor)
                .min(self.backoff_max_ms),
        )
    }

    /// One pass over the chunks, continuing an existing session if possible.
    fn send_once(
        &self,
        parent_id: &str,
        name: &str,
        bytes: &[u8],
        session: &mut Option<String>,
        on_session: &mut dyn FnMut(&str),
    ) -> Result<String, SyncError> {
        let total = bytes.len() as u64;
        let mut offset = 0u64;

        if let Some(uri) = session.clone() {
            match self.remote.query_offset(&uri, total) {
                Ok(ChunkStatus::Complete { file_id }) => return Ok(file_id),
                Ok(ChunkStatus::Incomplete { next_offset }) => offset = next_offset,
                Err(e) => {
                    tracing::debug!(file = name, error = %e, "Upload session expired, restarting");
                    *session = None;
                }
            }
        }
        let uri = match session.clone() {
            Some(uri) => uri,
            None => {
                let uri = self.remote.start_session(parent_id, name, total)?;
                on_session(&uri);
                *session = Some(uri.clone());
                uri
            }
        };

        loop {
            if offset > total {
                return Err(SyncError::Protocol(format!(
                    "remote expects offset {offset} beyond size {total}"
                )));
            }
            let end = (offset as usize).saturating_add(self.chunk_size).min(bytes.len());
            let chunk = &bytes[offset as usize..end];
            match self.remote.put_chunk(&uri, offset, total, chunk)? {
                ChunkStatus::Complete { file_id } => return Ok(file_id),
                ChunkStatus::Incomplete { next_offset } => {
                    if next_offset <= offset {
                        return Err(SyncError::Protocol(format!(
                            "no upload progress at offset {offset}"
                        )));
                    }
                    offset = next_offset;
                }
            }
        }
    }

    /// Up to `max_retries + 1` passes. Returns the file id and attempts used.
    fn send(
        &self,
        parent_id: &str,
        label: &str,
        bytes: &[u8],
        session: &mut Option<String>,
        on_session: &mut dyn FnMut(&str),
        on_retry: &mut dyn FnMut(u32, &SyncError),
    ) -> Result<(String, u32), (u32, SyncError)> {
        let name = label.rsplit('/').next().unwrap_or(label);
        let max_attempts = self.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(parent_id, name, bytes, session, on_session) {
                Ok(file_id) => return Ok((file_id, attempt)),
                Err(e) if !e.is_transient() => return Err((attempt, e)),
                Err(e) if attempt >= max_attempts => {
                    return Err((
                        attempt,
                        SyncError::RetriesExhausted {
                            path: label.to_string(),
                            attempts: attempt,
                            last: Box::new(e),
                        },
                    ));
                }
                Err(e) => {
                    let wait = self.backoff(attempt);
                    tracing::warn!(file = label, attempt, wait_ms = wait.as_millis() as u64, error = %e, "Upload retry");
                    on_retry(attempt, &e);
                    std::thread::sleep(wait);
                }
            }
        }
    }
}

/// State shared with upload workers; every update is persisted.
#[derive(Clone)]
struct SharedState {
    inner: Arc<Mutex<SyncState>>,
    run_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl SharedState {
    fn update<T>(&self, f: impl FnOnce(&mut SyncState) -> T) -> std::io::Result<T> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let out = f(&mut state);
        state.save(&self.run_dir, self.clock.now())?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&SyncState) -> T) -> T {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    fn snapshot(&self) -> SyncState {
        self.read(|s| s.clone())
    }
}

fn upload_file(
    uploader: &Uploader,
    shared: &SharedState,
    parent_id: &str,
    file: &LocalFile,
) -> Result<u32, SyncError> {
    let bytes = std::fs::read(&file.abs_path)?;
    let record = |session: Option<String>, file_id: Option<String>, attempts: u32| UploadedFile {
        path: file.path.clone(),
        size: file.size,
        sha256: file.sha256.clone(),
        md5: file.md5.clone(),
        file_id,
        session_uri: session,
        verified: false,
        attempts,
    };
    let mut session = shared.read(|s| {
        s.record(&file.path)
            .filter(|r| r.sha256 == file.sha256 && r.file_id.is_none())
            .and_then(|r| r.session_uri.clone())
    });

    let mut on_session = |uri: &str| {
        if let Err(e) = shared.update(|s| s.upsert_record(record(Some(uri.to_string()), None, 0))) {
            tracing::warn!(file = %file.path, error = %e, "Failed to persist upload session");
        }
    };
    let mut on_retry = |_attempt: u32, _e: &SyncError| {
        if let Err(e) = shared.update(|s| s.retries += 1) {
            tracing::warn!(file = %file.path, error = %e, "Failed to persist retry count");
        }
    };

    match uploader.send(
        parent_id,
        &file.path,
        &bytes,
        &mut session,
        &mut on_session,
        &mut on_retry,
    ) {
        Ok((file_id, attempts)) => {
            shared.update(|s| {
                s.upsert_record(record(None, Some(file_id), attempts));
                s.clear_failed_file(&file.path);
            })?;
            tracing::info!(file = %file.path, attempts, "File uploaded");
            Ok(attempts)
        }
        Err((attempts, err)) => {
            shared.update(|s| {
                if session.is_some() {
                    s.upsert_record(record(session.clone(), None, attempts));
                }
                s.mark_failed_file(&file.path, attempts, &err.to_string());
            })?;
            Err(err)
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════

pub struct SyncClient<'a> {
    ctx: &'a OpsContext,
}

impl<'a> SyncClient<'a> {
    pub fn new(ctx: &'a OpsContext) -> Self {
        Self { ctx }
    }

    fn queue(&self) -> SyncQueue {
        SyncQueue::new(&self.ctx.config.sync_queue_dir())
    }

    fn lock_options(&self) -> LockOptions {
        let cfg = &self.ctx.config.sync;
        LockOptions {
            ttl: Duration::from_secs(cfg.lock_ttl_secs),
            wait_timeout: Duration::from_millis(cfg.lock_wait_timeout_ms),
            poll_interval: Duration::from_millis(cfg.lock_poll_interval_ms.max(1)),
        }
    }

    fn uploader(&self, remote: Arc<dyn RemoteStore>) -> Uploader {
        let cfg = &self.ctx.config.sync;
        Uploader {
            remote,
            chunk_size: cfg.chunk_size_bytes.max(1),
            max_retries: cfg.max_retries,
            backoff_base_ms: cfg.backoff_base_ms,
            backoff_max_ms: cfg.backoff_max_ms,
        }
    }

    fn run_id_of(run_dir: &Path) -> String {
        run_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Park the run in `deferred` and queue it (e.g. host offline).
    pub fn defer(&self, run_dir: &Path, reason: &str) -> Result<SyncOutcome, SyncError> {
        let now = self.ctx.now();
        let run_id = Self::run_id_of(run_dir);
        let mut state = SyncState::load_or_new(run_dir, &run_id, now);
        state.transition(SyncStateKind::Deferred);
        state.last_error = Some(reason.to_string());
        state.save(run_dir, now)?;
        self.queue()
            .upsert(&run_id, run_dir, reason, Some(reason.to_string()), false, now)?;
        let mut outcome = SyncOutcome::new(&run_id, SyncStateKind::Deferred);
        outcome.error = Some(reason.to_string());
        Ok(outcome)
    }

    /// Record a failed attempt: state, queue entry, outcome.
    fn fail(
        &self,
        run_dir: &Path,
        state: &mut SyncState,
        err: SyncError,
        mut outcome: SyncOutcome,
    ) -> Result<SyncOutcome, SyncError> {
        let now = self.ctx.now();
        let message = redact_secrets(&err.to_string(), &self.ctx.secret_literals());
        let human = err.human_action_required();
        state.transition(SyncStateKind::Failed);
        state.last_error = Some(message.clone());
        state.save(run_dir, now)?;
        self.queue()
            .upsert(&state.run_id, run_dir, "failed", Some(message.clone()), human, now)?;
        tracing::warn!(
            run_id = %state.run_id,
            category = %err.category(),
            human_action = human,
            error = %message,
            "Sync failed"
        );
        outcome.state = SyncStateKind::Failed;
        outcome.error = Some(message);
        outcome.category = Some(err.category());
        outcome.human_action_required = human;
        outcome.warnings = state.warnings.clone();
        Ok(outcome)
    }

    /// Run one sync attempt. Protocol failures come back as a `failed`
    /// outcome; `Err` means the local state itself could not be written.
    pub fn sync_run(&self, run_dir: &Path) -> Result<SyncOutcome, SyncError> {
        let cfg = &self.ctx.config.sync;
        let now = self.ctx.now();
        let manifest: Option<Manifest> = artifacts::read_json_opt(&run_dir.join(MANIFEST));
        let run_id = manifest
            .as_ref()
            .map(|m| m.run_id.clone())
            .unwrap_or_else(|| Self::run_id_of(run_dir));
        let mut state = SyncState::load_or_new(run_dir, &run_id, now);
        let _span = tracing::info_span!("sync", run_id = %run_id).entered();

        if !cfg.enabled {
            state.transition(SyncStateKind::NotStarted);
            state.save(run_dir, now)?;
            return Ok(SyncOutcome::new(&run_id, SyncStateKind::NotStarted));
        }

        let outcome = SyncOutcome::new(&run_id, SyncStateKind::Pending);
        let Some(manifest) = manifest else {
            return self.fail(run_dir, &mut state, SyncError::ManifestMissing, outcome);
        };

        if cfg.dry_run {
            let mut outcome = SyncOutcome::new(&run_id, state.state);
            outcome.skipped = manifest.outputs.iter().map(|o| o.path.clone()).collect();
            tracing::info!(files = outcome.skipped.len(), "Sync dry run, nothing uploaded");
            return Ok(outcome);
        }

        let prior = state.state;
        let resumed = state.is_resumable();
        state.transition(SyncStateKind::Pending);

        let _lock = match FileLock::acquire(
            &run_dir.join(SYNC_LOCK),
            "sync",
            self.lock_options(),
            self.ctx.clock.as_ref(),
        ) {
            Ok(lock) => lock,
            Err(LockError::Contended { holder, .. }) => {
                // The holder owns sync_state.json; only the queue records the deferral.
                let reason = format!("sync lock held by {holder}");
                self.queue()
                    .upsert(&run_id, run_dir, "lock_contended", Some(reason.clone()), false, now)?;
                tracing::info!(holder = %holder, "Sync deferred, lock held");
                let mut outcome = SyncOutcome::new(&run_id, SyncStateKind::Deferred);
                outcome.error = Some(reason);
                return Ok(outcome);
            }
            Err(e) => return self.fail(run_dir, &mut state, e.into(), outcome),
        };

        if resumed {
            state.resume_count += 1;
        }
        state.save(run_dir, self.ctx.now())?;
        let mut outcome = outcome;
        outcome.resumed = resumed;

        let files = match verify_local_files(run_dir, &manifest) {
            Ok(files) => files,
            Err(e) => return self.fail(run_dir, &mut state, e, outcome),
        };

        if prior == SyncStateKind::Committed
            && files.iter().all(|f| {
                state
                    .record(&f.path)
                    .is_some_and(|r| r.verified && r.is_complete_for(&f.sha256))
            })
        {
            state.transition(SyncStateKind::Committed);
            state.save(run_dir, self.ctx.now())?;
            if !manifest.committed_drive {
                flip_committed_drive(run_dir)?;
            }
            self.queue().remove(&run_id)?;
            tracing::info!("Already committed, nothing to upload");
            outcome.state = SyncStateKind::Committed;
            outcome.skipped = files.into_iter().map(|f| f.path).collect();
            return Ok(outcome);
        }

        match self.attempt(run_dir, &manifest, &files, &mut state, &mut outcome) {
            Ok(()) => {
                self.queue().remove(&run_id)?;
                tracing::info!(
                    uploaded = outcome.uploaded.len(),
                    skipped = outcome.skipped.len(),
                    resume_count = state.resume_count,
                    "Sync committed"
                );
                Ok(outcome)
            }
            Err(e) => self.fail(run_dir, &mut state, e, outcome),
        }
    }

    fn attempt(
        &self,
        run_dir: &Path,
        manifest: &Manifest,
        files: &[LocalFile],
        state: &mut SyncState,
        outcome: &mut SyncOutcome,
    ) -> Result<(), SyncError> {
        let cfg = &self.ctx.config.sync;
        let remote = self.ctx.remote.clone().ok_or(SyncError::NoRemote)?;

        // Destination: <root>/<project>/<run_id>/<subdirs>
        let root = cfg.root_folder_id.clone();
        let project_folder = resolve_folder(remote.as_ref(), &root, &manifest.project)?;
        let run_folder = resolve_folder(remote.as_ref(), &project_folder, &manifest.run_id)?;
        state.remote_root_folder_id = Some(root);
        state.remote_run_folder_id = Some(run_folder.clone());

        if let Some(public) = remote
            .folder_permissions(&run_folder)?
            .into_iter()
            .find(|p| p.is_public())
        {
            tracing::warn!(folder = %run_folder, permission = %public, "Public link on destination");
            return Err(SyncError::PublicLinkDetected {
                folder_id: run_folder,
            });
        }

        let mut folders: HashMap<String, String> = HashMap::new();
        folders.insert(String::new(), run_folder.clone());
        for file in files {
            let mut parent = run_folder.clone();
            let mut key = String::new();
            for dir in file.subdirs() {
                key = if key.is_empty() {
                    dir.to_string()
                } else {
                    format!("{key}/{dir}")
                };
                parent = match folders.get(&key) {
                    Some(id) => id.clone(),
                    None => {
                        let id = resolve_folder(remote.as_ref(), &parent, dir)?;
                        folders.insert(key.clone(), id.clone());
                        id
                    }
                };
            }
        }
        let parent_of = |file: &LocalFile| -> String {
            folders
                .get(&file.subdirs().join("/"))
                .cloned()
                .unwrap_or_else(|| run_folder.clone())
        };

        let uploader = self.uploader(Arc::clone(&remote));
        let upload_manifest = |committed: bool, state: &mut SyncState| -> Result<(), SyncError> {
            let mut copy = manifest.clone();
            copy.committed = committed;
            copy.committed_drive = committed;
            let bytes = serde_json::to_vec_pretty(&copy)?;
            uploader
                .send(
                    &run_folder,
                    MANIFEST,
                    &bytes,
                    &mut None,
                    &mut |_: &str| {},
                    &mut |_: u32, _: &SyncError| state.retries += 1,
                )
                .map(|_| ())
                .map_err(|(_, e)| e)
        };

        upload_manifest(false, &mut *state)?;

        // Uploading: failed files first, then manifest order.
        state.transition(SyncStateKind::Uploading);
        let failed_first: Vec<&LocalFile> = files
            .iter()
            .filter(|f| state.failed_files.iter().any(|x| x.path == f.path))
            .chain(
                files
                    .iter()
                    .filter(|f| !state.failed_files.iter().any(|x| x.path == f.path)),
            )
            .collect();
        let (done, todo): (Vec<&LocalFile>, Vec<&LocalFile>) = failed_first
            .into_iter()
            .partition(|f| state.record(&f.path).is_some_and(|r| r.is_complete_for(&f.sha256)));
        state.pending_files = files
            .iter()
            .filter(|f| !state.record(&f.path).is_some_and(|r| r.verified && r.sha256 == f.sha256))
            .map(|f| f.path.clone())
            .collect();
        state.save(run_dir, self.ctx.now())?;
        outcome.skipped = done.iter().map(|f| f.path.clone()).collect();

        let shared = SharedState {
            inner: Arc::new(Mutex::new(state.clone())),
            run_dir: run_dir.to_path_buf(),
            clock: Arc::clone(&self.ctx.clock),
        };
        let mut batch = WorkerPool::new(cfg.upload_workers).batch::<Result<u32, SyncError>>();
        for file in &todo {
            let uploader = uploader.clone();
            let shared = shared.clone();
            let parent_id = parent_of(*file);
            let file = (*file).clone();
            batch.submit(move || upload_file(&uploader, &shared, &parent_id, &file));
        }
        let results = batch.join_all();
        *state = shared.snapshot();

        let mut first_error = None;
        for (file, result) in todo.iter().zip(results) {
            match result {
                Ok(Ok(_)) => outcome.uploaded.push(file.path.clone()),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(pool) => {
                    state.mark_failed_file(&file.path, 1, &pool.to_string());
                    first_error.get_or_insert(SyncError::Protocol(format!("upload worker: {pool}")));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        // Verifying
        state.transition(SyncStateKind::Verifying);
        state.save(run_dir, self.ctx.now())?;
        for file in files {
            let Some(record) = state.record(&file.path).cloned() else {
                return Err(SyncError::Verification {
                    path: file.path.clone(),
                    detail: "no upload record".into(),
                });
            };
            if !record.verified {
                if let Err(e) = self.verify_remote(remote.as_ref(), file, &record, state) {
                    state.uploaded_files.retain(|r| r.path != file.path);
                    state.mark_failed_file(&file.path, record.attempts, &e.to_string());
                    return Err(e);
                }
            }
            if let Some(r) = state.uploaded_files.iter_mut().find(|r| r.path == file.path) {
                r.verified = true;
            }
            state.pending_files.retain(|p| p != &file.path);
            state.save(run_dir, self.ctx.now())?;
        }

        upload_manifest(true, &mut *state)?;

        state.transition(SyncStateKind::Committed);
        state.failed_files.clear();
        state.pending_files.clear();
        state.last_error = None;
        state.save(run_dir, self.ctx.now())?;
        flip_committed_drive(run_dir)?;
        outcome.state = SyncStateKind::Committed;
        outcome.warnings = state.warnings.clone();
        Ok(())
    }

    fn verify_remote(
        &self,
        remote: &dyn RemoteStore,
        file: &LocalFile,
        record: &UploadedFile,
        state: &mut SyncState,
    ) -> Result<(), SyncError> {
        let file_id = record.file_id.as_deref().ok_or_else(|| SyncError::Verification {
            path: file.path.clone(),
            detail: "upload incomplete".into(),
        })?;
        let meta = remote.file_metadata(file_id)?;
        if meta.size != file.size {
            return Err(SyncError::Verification {
                path: file.path.clone(),
                detail: format!("remote size {} != local {}", meta.size, file.size),
            });
        }
        if !self.ctx.config.sync.verify_remote_checksum {
            return Ok(());
        }
        match (&meta.sha256, &meta.md5) {
            (Some(sha), _) if !sha.eq_ignore_ascii_case(&file.sha256) => {
                Err(SyncError::Verification {
                    path: file.path.clone(),
                    detail: "sha256 mismatch".into(),
                })
            }
            (None, Some(md5)) if !md5.eq_ignore_ascii_case(&file.md5) => {
                Err(SyncError::Verification {
                    path: file.path.clone(),
                    detail: "md5 mismatch".into(),
                })
            }
            (None, None) => {
                state.add_warning(format!("checksum_unavailable:{}", file.path));
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Copy-on-write flip of `committed_drive` in the local manifest.
fn flip_committed_drive(run_dir: &Path) -> Result<(), SyncError> {
    let path = run_dir.join(MANIFEST);
    let mut value: serde_json::Value = artifacts::read_json(&path)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("committed_drive".into(), serde_json::Value::Bool(true));
    }
    artifacts::write_json_atomic(&path, &value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ExtractSummary, FileEntry, OpsSummary, RunStatus, SYNC_STATE};
    use crate::config::OpsConfig;
    use crate::context::FixedClock;
    use crate::preflight::auth::StaticTokenSource;
    use crate::sync::transport::MockRemoteStore;

    const FILES: &[(&str, &str)] = &[
        ("ingestion/text.md", "## 1. a.pdf\n\nhello\n"),
        ("metrics.json", "{\"m\":1}"),
        ("warnings.json", "{\"w\":[]}"),
    ];

    struct Fixture {
        _tmp: tempfile::TempDir,
        run_dir: PathBuf,
        ctx: OpsContext,
        remote: Arc<MockRemoteStore>,
    }

    fn fixture_with(remote: MockRemoteStore, tweak: impl FnOnce(&mut OpsConfig)) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = OpsConfig::default();
        config.runs_dir = tmp.path().join("runs");
        config.project = "proj".into();
        config.sync.enabled = true;
        config.sync.chunk_size_bytes = 4;
        config.sync.backoff_base_ms = 1;
        config.sync.backoff_max_ms = 2;
        config.sync.max_retries = 2;
        tweak(&mut config);

        let run_dir = config.run_dir("run-1");
        let mut outputs = Vec::new();
        for (path, content) in FILES {
            let abs = run_dir.join(path);
            std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
            std::fs::write(&abs, content).unwrap();
            outputs.push(FileEntry {
                path: path.to_string(),
                size: content.len() as u64,
                sha256: hashing::sha256_bytes(content.as_bytes()),
            });
        }
        let manifest = Manifest {
            schema_version: "1.0".into(),
            run_id: "run-1".into(),
            project: "proj".into(),
            created_at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            inputs: vec![],
            outputs,
            extract: ExtractSummary::default(),
            ops: OpsSummary {
                status: RunStatus::Success,
                preflight_passed: true,
                sync_enabled: true,
                warning_count: 0,
            },
            committed: true,
            committed_local: true,
            committed_drive: false,
        };
        artifacts::write_json_atomic(&run_dir.join(MANIFEST), &manifest).unwrap();

        let remote = Arc::new(remote);
        let ctx = OpsContext::new({
            let mut c = config.clone();
            c.sync.enabled = false;
            c
        })
        .unwrap()
        .with_clock(Arc::new(FixedClock::at("2024-05-01T00:00:00Z")))
        .with_token_source(Arc::new(StaticTokenSource::new("tok")))
        .with_remote(remote.clone());
        let ctx = OpsContext { config, ..ctx };
        Fixture {
            _tmp: tmp,
            run_dir,
            ctx,
            remote,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockRemoteStore::new(), |_| {})
    }

    #[test]
    fn uploads_commits_and_flips_manifest() {
        let fx = fixture();
        let outcome = SyncClient::new(&fx.ctx).sync_run(&fx.run_dir).unwrap();
        assert_eq!(outcome.state, SyncStateKind::Committed);
        assert_eq!(outcome.uploaded.len(), 3);

        let run_folder = fx.remote.folder_at(&["proj", "run-1"]).unwrap();
        assert_eq!(
            fx.remote.children_of(&run_folder),
            vec!["ingestion", "manifest.json", "metrics.json", "warnings.json"]
        );
        let remote_manifest: Manifest =
            serde_json::from_slice(&fx.remote.file_content(&run_folder, MANIFEST).unwrap()).unwrap();
        assert!(remote_manifest.committed_drive);

        let local: Manifest = artifacts::read_json(&fx.run_dir.join(MANIFEST)).unwrap();
        assert!(local.committed_drive);
        let state = SyncState::load(&fx.run_dir).unwrap();
        assert_eq!(state.state, SyncStateKind::Committed);
        assert!(state.uploaded_files.iter().all(|f| f.verified));
        assert!(state.pending_files.is_empty());
        assert!(!fx.run_dir.join(SYNC_LOCK).exists());
    }

    #[test]
    fn second_run_uploads_nothing() {
        let fx = fixture();
        let client = SyncClient::new(&fx.ctx);
        client.sync_run(&fx.run_dir).unwrap();
        let puts = fx.remote.chunk_puts();
        let sessions = fx.remote.sessions_started();

        let outcome = client.sync_run(&fx.run_dir).unwrap();
        assert_eq!(outcome.state, SyncStateKind::Committed);
        assert!(outcome.uploaded.is_empty());
        assert_eq!(outcome.skipped.len(), 3);
        assert_eq!(fx.remote.chunk_puts(), puts);
        assert_eq!(fx.remote.sessions_started(), sessions);
    }

    #[test]
    fn resume_uploads_only_missing_files() {
        let fx = fixture();
        fx.remote.fail_uploads_of("warnings.json", "connection reset");
        let client = SyncClient::new(&fx.ctx);

        let first = client.sync_run(&fx.run_dir).unwrap();
        assert_eq!(first.state, SyncStateKind::Failed);
        let state = SyncState::load(&fx.run_dir).unwrap();
        assert_eq!(state.failed_files[0].path, "warnings.json");
        assert!(SyncQueue::new(&fx.ctx.config.sync_queue_dir()).get("run-1").is_some());

        fx.remote.clear_failures();
        let second = client.sync_run(&fx.run_dir).unwrap();
        assert_eq!(second.state, SyncStateKind::Committed);
        assert!(second.resumed);
        assert_eq!(second.uploaded, vec!["warnings.json"]);
        let state = SyncState::load(&fx.run_dir).unwrap();
        assert_eq!(state.resume_count, 1);
        assert!(state.failed_files.is_empty());
        assert!(SyncQueue::new(&fx.ctx.config.sync_queue_dir()).get("run-1").is_none());
    }

    #[test]
    fn changed_file_is_reuploaded() {
        let fx = fixture();
        let client = SyncClient::new(&fx.ctx);
        client.sync_run(&fx.run_dir).unwrap();

        let new_content = "{\"m\":2}";
        std::fs::write(fx.run_dir.join("metrics.json"), new_content).unwrap();
        let mut manifest: Manifest = artifacts::read_json(&fx.run_dir.join(MANIFEST)).unwrap();
        for out in manifest.outputs.iter_mut().filter(|o| o.path == "metrics.json") {
            out.sha256 = hashing::sha256_bytes(new_content.as_bytes());
        }
        artifacts::write_json_atomic(&fx.run_dir.join(MANIFEST), &manifest).unwrap();

        let outcome = client.sync_run(&fx.run_dir).unwrap();
        assert_eq!(outcome.state, SyncStateKind::Committed);
        assert_eq!(outcome.uploaded, vec!["metrics.json"]);
    }

    #[test]
    fn public_destination_fails_before_any_chunk() {
        let fx = fixture_with(MockRemoteStore::new().with_public_folder("root"), |_| {});
        let outcome = SyncClient::new(&fx.ctx).sync_run(&fx.run_dir).unwrap();
        assert_eq!(outcome.state, SyncStateKind::Failed);
        assert!(outcome
            .error
            .as_deref()
            .unwrap()
            .contains("permissions_public_link_detected"));
        assert!(outcome.human_action_required);
        assert_eq!(fx.remote.chunk_puts(), 0);
        let item = SyncQueue::new(&fx.ctx.config.sync_queue_dir()).get("run-1").unwrap();
        assert!(item.human_action_required);
    }

    #[test]
    fn duplicate_folders_fail() {
        let remote = MockRemoteStore::new();
        let epoch = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        remote.add_folder("root", "proj", epoch);
        remote.add_folder("root", "proj", epoch);
        let fx = fixture_with(remote, |_| {});
        let outcome = SyncClient::new(&fx.ctx).sync_run(&fx.run_dir).unwrap();
        assert_eq!(outcome.state, SyncStateKind::Failed);
        assert!(outcome.error.unwrap().starts_with("duplicate_remote_folder"));
    }

    #[test]
    fn retries_exhausted_records_attempts() {
        let fx = fixture();
        fx.remote.fail_uploads_of("metrics.json", "connection reset");
        let outcome = SyncClient::new(&fx.ctx).sync_run(&fx.run_dir).unwrap();
        assert_eq!(outcome.state, SyncStateKind::Failed);
        assert_eq!(outcome.category, Some(ErrorCategory::Network));

        let state = SyncState::load(&fx.run_dir).unwrap();
        let failed = state
            .failed_files
            .iter()
            .find(|f| f.path == "metrics.json")
            .unwrap();
        assert!(failed.attempts >= fx.ctx.config.sync.max_retries + 1);
        assert!(state.retries >= fx.ctx.config.sync.max_retries);
        let value: serde_json::Value = artifacts::read_json(&fx.run_dir.join(SYNC_STATE)).unwrap();
        assert!(crate::contract::validate_value(SYNC_STATE, &value).unwrap().is_empty());
    }

    #[test]
    fn transient_chunk_failure_is_retried() {
        let fx = fixture();
        // The first chunk sent is the draft manifest's.
        fx.remote.fail_next_chunks(1);
        let outcome = SyncClient::new(&fx.ctx).sync_run(&fx.run_dir).unwrap();
        assert_eq!(outcome.state, SyncStateKind::Committed);
        assert_eq!(outcome.uploaded.len(), 3);
        assert_eq!(SyncState::load(&fx.run_dir).unwrap().retries, 1);
    }

    #[test]
    fn interrupted_upload_continues_its_session() {
        let fx = fixture();
        fx.remote.fail_uploads_of_from("text.md", 8, "connection reset");
        let client = SyncClient::new(&fx.ctx);

        let first = client.sync_run(&fx.run_dir).unwrap();
        assert_eq!(first.state, SyncStateKind::Failed);
        assert_eq!(fx.remote.sessions_started_for("text.md"), 1);
        assert_eq!(fx.remote.accepted_offsets("text.md"), vec![0, 4]);
        let state = SyncState::load(&fx.run_dir).unwrap();
        let record = state.record("ingestion/text.md").unwrap();
        assert!(record.session_uri.is_some());
        assert!(record.file_id.is_none());

        fx.remote.clear_failures();
        let second = client.sync_run(&fx.run_dir).unwrap();
        assert_eq!(second.state, SyncStateKind::Committed);
        assert!(second.resumed);
        assert_eq!(second.uploaded, vec!["ingestion/text.md"]);
        assert_eq!(fx.remote.sessions_started_for("text.md"), 1);
        assert_eq!(fx.remote.accepted_offsets("text.md"), vec![0, 4, 8, 12, 16]);

        let folder = fx.remote.folder_at(&["proj", "run-1", "ingestion"]).unwrap();
        assert_eq!(
            fx.remote.file_content(&folder, "text.md").unwrap(),
            FILES[0].1.as_bytes()
        );
    }

    #[test]
    fn missing_checksum_is_a_warning() {
        let fx = fixture_with(MockRemoteStore::new().without_checksums(), |_| {});
        let outcome = SyncClient::new(&fx.ctx).sync_run(&fx.run_dir).unwrap();
        assert_eq!(outcome.state, SyncStateKind::Committed);
        assert!(outcome
            .warnings
            .contains(&"checksum_unavailable:metrics.json".to_string()));
    }

    #[test]
    fn contended_lock_defers_without_network() {
        let fx = fixture();
        let _held = FileLock::acquire(
            &fx.run_dir.join(SYNC_LOCK),
            "other-process",
            LockOptions::default(),
            fx.ctx.clock.as_ref(),
        )
        .unwrap();
        let outcome = SyncClient::new(&fx.ctx).sync_run(&fx.run_dir).unwrap();
        assert_eq!(outcome.state, SyncStateKind::Deferred);
        assert_eq!(fx.remote.chunk_puts(), 0);
        let item = SyncQueue::new(&fx.ctx.config.sync_queue_dir()).get("run-1").unwrap();
        assert_eq!(item.reason, "lock_contended");
    }

    #[test]
    fn local_tampering_fails_before_upload() {
        let fx = fixture();
        std::fs::write(fx.run_dir.join("metrics.json"), "tampered").unwrap();
        let outcome = SyncClient::new(&fx.ctx).sync_run(&fx.run_dir).unwrap();
        assert_eq!(outcome.state, SyncStateKind::Failed);
        assert!(outcome.error.unwrap().contains("local hash mismatch"));
        assert_eq!(fx.remote.chunk_puts(), 0);
    }

    #[test]
    fn disabled_sync_is_not_started() {
        let fx = fixture_with(MockRemoteStore::new(), |c| c.sync.enabled = false);
        let outcome = SyncClient::new(&fx.ctx).sync_run(&fx.run_dir).unwrap();
        assert_eq!(outcome.state, SyncStateKind::NotStarted);
        assert_eq!(
            SyncState::load(&fx.run_dir).unwrap().state,
            SyncStateKind::NotStarted
        );
    }

    #[test]
    fn defer_queues_the_run() {
        let fx = fixture();
        let outcome = SyncClient::new(&fx.ctx)
            .defer(&fx.run_dir, "offline")
            .unwrap();
        assert_eq!(outcome.state, SyncStateKind::Deferred);
        assert_eq!(
            SyncState::load(&fx.run_dir).unwrap().state,
            SyncStateKind::Deferred
        );
        assert_eq!(SyncQueue::new(&fx.ctx.config.sync_queue_dir()).backlog(), 1);
    }
}
