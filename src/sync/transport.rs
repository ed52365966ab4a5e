//! Remote object-store transport.
//!
//! [`RemoteStore`] is the seam between the sync protocol and the network.
//! [`HttpRemoteStore`] speaks the resumable-upload HTTP API with blocking
//! `reqwest`; [`MockRemoteStore`] keeps everything in memory for tests.
//!
//! Uploading a file with the same name into the same folder replaces it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use serde::{Deserialize, Serialize};

use super::SyncError;
use crate::config::SyncConfig;
use crate::hashing;
use crate::preflight::auth::TokenSource;

/// Folder or file entry as listed by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_folder: bool,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePermission {
    /// `user`, `group`, `domain` or `anyone`.
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
}

impl RemotePermission {
    pub fn is_public(&self) -> bool {
        self.kind == "anyone"
    }
}

impl std::fmt::Display for RemotePermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileMeta {
    pub id: String,
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
}

/// Result of sending (or querying) a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStatus {
    /// More bytes expected, starting at `next_offset`.
    Incomplete { next_offset: u64 },
    Complete { file_id: String },
}

/// Remote store operations used by the sync client (allows mocking for tests).
pub trait RemoteStore: Send + Sync {
    /// Create `name` under `parent_id` unless it exists; returns the folder.
    fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<RemoteEntry, SyncError>;

    fn list_children(&self, parent_id: &str) -> Result<Vec<RemoteEntry>, SyncError>;

    /// Effective permissions, including those inherited from ancestors.
    fn folder_permissions(&self, folder_id: &str) -> Result<Vec<RemotePermission>, SyncError>;

    /// Open a resumable upload session; returns its URI.
    fn start_session(&self, parent_id: &str, name: &str, size: u64) -> Result<String, SyncError>;

    fn put_chunk(
        &self,
        session_uri: &str,
        offset: u64,
        total: u64,
        bytes: &[u8],
    ) -> Result<ChunkStatus, SyncError>;

    /// Ask the session how many bytes it already holds.
    fn query_offset(&self, session_uri: &str, total: u64) -> Result<ChunkStatus, SyncError>;

    fn file_metadata(&self, file_id: &str) -> Result<RemoteFileMeta, SyncError>;

    /// Reparent an entry (used by duplicate-folder repair).
    fn move_entry(&self, entry_id: &str, new_parent_id: &str) -> Result<(), SyncError>;
}

// ═══════════════════════════════════════════════════════════
// HTTP implementation
// ═══════════════════════════════════════════════════════════

pub struct HttpRemoteStore {
    api_base: String,
    upload_base: String,
    client: reqwest::blocking::Client,
    tokens: Arc<dyn TokenSource>,
}

#[derive(Serialize)]
struct EnsureFolderRequest<'a> {
    parent_id: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct StartSessionRequest<'a> {
    parent_id: &'a str,
    name: &'a str,
    size: u64,
}

#[derive(Deserialize)]
struct StartSessionResponse {
    session_uri: Option<String>,
}

#[derive(Deserialize)]
struct ChildrenResponse {
    children: Vec<RemoteEntry>,
}

#[derive(Deserialize)]
struct PermissionsResponse {
    permissions: Vec<RemotePermission>,
}

#[derive(Deserialize)]
struct CompletedUpload {
    id: String,
}

#[derive(Serialize)]
struct MoveRequest<'a> {
    parent_id: &'a str,
}

/// Parse `Range: bytes=0-N` into the next offset (`N + 1`).
pub fn next_offset_from_range(header: Option<&str>) -> Result<u64, SyncError> {
    let Some(value) = header else {
        return Ok(0);
    };
    let end = value
        .trim()
        .strip_prefix("bytes=")
        .and_then(|r| r.split_once('-'))
        .map(|(_, end)| end.trim())
        .ok_or_else(|| SyncError::Protocol(format!("bad Range header: {value}")))?;
    end.parse::<u64>()
        .map(|n| n + 1)
        .map_err(|_| SyncError::Protocol(format!("bad Range header: {value}")))
}

impl HttpRemoteStore {
    pub fn new(config: &SyncConfig, tokens: Arc<dyn TokenSource>) -> Result<Self, SyncError> {
        // 308 is the resumable "keep going" reply, not a redirect.
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| SyncError::Connection(e.to_string()))?;

        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            upload_base: config.upload_base.trim_end_matches('/').to_string(),
            client,
            tokens,
        })
    }

    fn send(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response, SyncError> {
        let token = self.tokens.access_token()?;
        let response = request.bearer_auth(token).send().map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                SyncError::Connection(e.to_string())
            } else {
                SyncError::Protocol(e.to_string())
            }
        })?;
        if response.status().as_u16() == 401 {
            self.tokens.invalidate();
        }
        Ok(response)
    }

    /// Fail on any non-2xx status.
    fn expect_success(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, SyncError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(SyncError::Http {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            })
        }
    }

    fn json<T: serde::de::DeserializeOwned>(
        response: reqwest::blocking::Response,
    ) -> Result<T, SyncError> {
        response
            .json()
            .map_err(|e| SyncError::Protocol(format!("response parse error: {e}")))
    }

    fn chunk_status(response: reqwest::blocking::Response) -> Result<ChunkStatus, SyncError> {
        match response.status().as_u16() {
            308 => {
                let range = response
                    .headers()
                    .get(RANGE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(ChunkStatus::Incomplete {
                    next_offset: next_offset_from_range(range.as_deref())?,
                })
            }
            200 | 201 => {
                let done: CompletedUpload = Self::json(response)?;
                Ok(ChunkStatus::Complete { file_id: done.id })
            }
            _ => Self::expect_success(response).and_then(|_| {
                Err(SyncError::Protocol("unexpected upload status".into()))
            }),
        }
    }
}

impl RemoteStore for HttpRemoteStore {
    fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<RemoteEntry, SyncError> {
        let url = format!("{}/folders/ensure", self.api_base);
        let response = self.send(
            self.client
                .post(&url)
                .json(&EnsureFolderRequest { parent_id, name }),
        )?;
        Self::json(Self::expect_success(response)?)
    }

    fn list_children(&self, parent_id: &str) -> Result<Vec<RemoteEntry>, SyncError> {
        let url = format!("{}/children", self.api_base);
        let response = self.send(self.client.get(&url).query(&[("parent_id", parent_id)]))?;
        let body: ChildrenResponse = Self::json(Self::expect_success(response)?)?;
        Ok(body.children)
    }

    fn folder_permissions(&self, folder_id: &str) -> Result<Vec<RemotePermission>, SyncError> {
        let url = format!("{}/files/{}/permissions", self.api_base, folder_id);
        let response = self.send(self.client.get(&url))?;
        let body: PermissionsResponse = Self::json(Self::expect_success(response)?)?;
        Ok(body.permissions)
    }

    fn start_session(&self, parent_id: &str, name: &str, size: u64) -> Result<String, SyncError> {
        let url = format!("{}/resumable/start", self.upload_base);
        let response = self.send(self.client.post(&url).json(&StartSessionRequest {
            parent_id,
            name,
            size,
        }))?;
        let response = Self::expect_success(response)?;
        if let Some(location) = response.headers().get(LOCATION).and_then(|v| v.to_str().ok()) {
            return Ok(location.to_string());
        }
        let body: StartSessionResponse = Self::json(response)?;
        body.session_uri
            .ok_or_else(|| SyncError::Protocol("upload session URI missing".into()))
    }

    fn put_chunk(
        &self,
        session_uri: &str,
        offset: u64,
        total: u64,
        bytes: &[u8],
    ) -> Result<ChunkStatus, SyncError> {
        let range = if bytes.is_empty() {
            format!("bytes */{total}")
        } else {
            format!("bytes {}-{}/{}", offset, offset + bytes.len() as u64 - 1, total)
        };
        let response = self.send(
            self.client
                .put(session_uri)
                .header(CONTENT_RANGE, range)
                .body(bytes.to_vec()),
        )?;
        Self::chunk_status(response)
    }

    fn query_offset(&self, session_uri: &str, total: u64) -> Result<ChunkStatus, SyncError> {
        let response = self.send(
            self.client
                .put(session_uri)
                .header(CONTENT_RANGE, format!("bytes */{total}"))
                .body(Vec::new()),
        )?;
        Self::chunk_status(response)
    }

    fn file_metadata(&self, file_id: &str) -> Result<RemoteFileMeta, SyncError> {
        let url = format!("{}/files/{}", self.api_base, file_id);
        let response = self.send(self.client.get(&url))?;
        Self::json(Self::expect_success(response)?)
    }

    fn move_entry(&self, entry_id: &str, new_parent_id: &str) -> Result<(), SyncError> {
        let url = format!("{}/files/{}", self.api_base, entry_id);
        let response = self.send(self.client.patch(&url).json(&MoveRequest {
            parent_id: new_parent_id,
        }))?;
        Self::expect_success(response)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// In-memory mock
// ═══════════════════════════════════════════════════════════

struct MockFile {
    parent_id: String,
    name: String,
    bytes: Vec<u8>,
}

struct MockSession {
    parent_id: String,
    name: String,
    total: u64,
    received: Vec<u8>,
}

#[derive(Default)]
struct MockInner {
    folders: Vec<RemoteEntry>,
    files: HashMap<String, MockFile>,
    sessions: HashMap<String, MockSession>,
    public: HashSet<String>,
    failing_names: HashMap<String, String>,
    /// Chunks at or past the offset fail for the named file.
    failing_from: HashMap<String, (u64, String)>,
    fail_next_chunks: usize,
    session_starts: HashMap<String, usize>,
    accepted: HashMap<String, Vec<u64>>,
    next_id: usize,
}

impl MockInner {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn parent_of(&self, id: &str) -> Option<String> {
        self.folders
            .iter()
            .find(|f| f.id == id)
            .and_then(|f| f.parent_id.clone())
    }
}

/// In-memory remote with injectable faults. Root folder id is `root`.
pub struct MockRemoteStore {
    inner: Mutex<MockInner>,
    omit_checksums: bool,
    chunk_puts: AtomicUsize,
    sessions_started: AtomicUsize,
}

impl Default for MockRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemoteStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner::default()),
            omit_checksums: false,
            chunk_puts: AtomicUsize::new(0),
            sessions_started: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// File metadata carries no checksums.
    pub fn without_checksums(mut self) -> Self {
        self.omit_checksums = true;
        self
    }

    /// Share `folder_id` (and everything below it) with anyone.
    pub fn with_public_folder(self, folder_id: &str) -> Self {
        self.lock().public.insert(folder_id.to_string());
        self
    }

    /// Add a folder directly, e.g. to stage duplicates.
    pub fn add_folder(&self, parent_id: &str, name: &str, created_at: DateTime<Utc>) -> String {
        let mut inner = self.lock();
        let id = inner.id("folder");
        inner.folders.push(RemoteEntry {
            id: id.clone(),
            name: name.to_string(),
            is_folder: true,
            parent_id: Some(parent_id.to_string()),
            created_at: Some(created_at),
        });
        id
    }

    /// Every chunk for files named `name` fails with a connection error.
    pub fn fail_uploads_of(&self, name: &str, message: &str) {
        self.lock()
            .failing_names
            .insert(name.to_string(), message.to_string());
    }

    /// Chunks for files named `name` fail once the upload reaches `offset`.
    pub fn fail_uploads_of_from(&self, name: &str, offset: u64, message: &str) {
        self.lock()
            .failing_from
            .insert(name.to_string(), (offset, message.to_string()));
    }

    /// The next `n` chunk PUTs fail with a connection error.
    pub fn fail_next_chunks(&self, n: usize) {
        self.lock().fail_next_chunks = n;
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failing_names.clear();
        inner.failing_from.clear();
        inner.fail_next_chunks = 0;
    }

    pub fn chunk_puts(&self) -> usize {
        self.chunk_puts.load(Ordering::SeqCst)
    }

    pub fn sessions_started(&self) -> usize {
        self.sessions_started.load(Ordering::SeqCst)
    }

    pub fn sessions_started_for(&self, name: &str) -> usize {
        self.lock().session_starts.get(name).copied().unwrap_or(0)
    }

    /// Offsets of accepted chunks for files named `name`, in arrival order.
    pub fn accepted_offsets(&self, name: &str) -> Vec<u64> {
        self.lock().accepted.get(name).cloned().unwrap_or_default()
    }

    /// Id of the folder reached by following `names` from `root`.
    pub fn folder_at(&self, names: &[&str]) -> Option<String> {
        let inner = self.lock();
        let mut current = "root".to_string();
        for name in names {
            current = inner
                .folders
                .iter()
                .find(|f| f.parent_id.as_deref() == Some(current.as_str()) && f.name == *name)?
                .id
                .clone();
        }
        Some(current)
    }

    /// Content of the file `name` inside `folder_id`.
    pub fn file_content(&self, folder_id: &str, name: &str) -> Option<Vec<u8>> {
        self.lock()
            .files
            .values()
            .find(|f| f.parent_id == folder_id && f.name == name)
            .map(|f| f.bytes.clone())
    }

    pub fn children_of(&self, folder_id: &str) -> Vec<String> {
        let inner = self.lock();
        let mut names: Vec<String> = inner
            .folders
            .iter()
            .filter(|f| f.parent_id.as_deref() == Some(folder_id))
            .map(|f| f.name.clone())
            .chain(
                inner
                    .files
                    .values()
                    .filter(|f| f.parent_id == folder_id)
                    .map(|f| f.name.clone()),
            )
            .collect();
        names.sort();
        names
    }
}

impl RemoteStore for MockRemoteStore {
    fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<RemoteEntry, SyncError> {
        let mut inner = self.lock();
        if let Some(existing) = inner
            .folders
            .iter()
            .find(|f| f.parent_id.as_deref() == Some(parent_id) && f.name == name)
        {
            return Ok(existing.clone());
        }
        let id = inner.id("folder");
        let entry = RemoteEntry {
            id,
            name: name.to_string(),
            is_folder: true,
            parent_id: Some(parent_id.to_string()),
            created_at: Some(Utc::now()),
        };
        inner.folders.push(entry.clone());
        Ok(entry)
    }

    fn list_children(&self, parent_id: &str) -> Result<Vec<RemoteEntry>, SyncError> {
        let inner = self.lock();
        let mut children: Vec<RemoteEntry> = inner
            .folders
            .iter()
            .filter(|f| f.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.extend(inner.files.iter().filter(|(_, f)| f.parent_id == parent_id).map(
            |(id, f)| RemoteEntry {
                id: id.clone(),
                name: f.name.clone(),
                is_folder: false,
                parent_id: Some(f.parent_id.clone()),
                created_at: None,
            },
        ));
        Ok(children)
    }

    fn folder_permissions(&self, folder_id: &str) -> Result<Vec<RemotePermission>, SyncError> {
        let inner = self.lock();
        let mut current = Some(folder_id.to_string());
        let mut perms = vec![RemotePermission {
            kind: "user".into(),
            role: "owner".into(),
        }];
        while let Some(id) = current {
            if inner.public.contains(&id) {
                perms.push(RemotePermission {
                    kind: "anyone".into(),
                    role: "reader".into(),
                });
                break;
            }
            current = inner.parent_of(&id);
        }
        Ok(perms)
    }

    fn start_session(&self, parent_id: &str, name: &str, size: u64) -> Result<String, SyncError> {
        self.sessions_started.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        *inner.session_starts.entry(name.to_string()).or_default() += 1;
        let uri = format!("mock://session/{}", inner.id("session"));
        inner.sessions.insert(
            uri.clone(),
            MockSession {
                parent_id: parent_id.to_string(),
                name: name.to_string(),
                total: size,
                received: Vec::new(),
            },
        );
        Ok(uri)
    }

    fn put_chunk(
        &self,
        session_uri: &str,
        offset: u64,
        total: u64,
        bytes: &[u8],
    ) -> Result<ChunkStatus, SyncError> {
        self.chunk_puts.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        if inner.fail_next_chunks > 0 {
            inner.fail_next_chunks -= 1;
            return Err(SyncError::Connection("injected chunk failure".into()));
        }
        let name = inner
            .sessions
            .get(session_uri)
            .map(|s| s.name.clone())
            .ok_or_else(|| SyncError::Http {
                status: 404,
                body: "unknown session".into(),
            })?;
        if let Some(message) = inner.failing_names.get(&name) {
            return Err(SyncError::Connection(message.clone()));
        }
        if let Some((from, message)) = inner.failing_from.get(&name) {
            if offset >= *from {
                return Err(SyncError::Connection(message.clone()));
            }
        }

        let (received, expected) = {
            let session = inner
                .sessions
                .get_mut(session_uri)
                .ok_or_else(|| SyncError::Protocol("session vanished".into()))?;
            if offset != session.received.len() as u64 || total != session.total {
                return Err(SyncError::Http {
                    status: 400,
                    body: format!("expected offset {}", session.received.len()),
                });
            }
            session.received.extend_from_slice(bytes);
            (session.received.len() as u64, session.total)
        };
        inner.accepted.entry(name).or_default().push(offset);
        if received < expected {
            return Ok(ChunkStatus::Incomplete {
                next_offset: received,
            });
        }

        let done = inner
            .sessions
            .remove(session_uri)
            .ok_or_else(|| SyncError::Protocol("session vanished".into()))?;
        inner
            .files
            .retain(|_, f| !(f.parent_id == done.parent_id && f.name == done.name));
        let id = inner.id("file");
        inner.files.insert(
            id.clone(),
            MockFile {
                parent_id: done.parent_id,
                name: done.name,
                bytes: done.received,
            },
        );
        Ok(ChunkStatus::Complete { file_id: id })
    }

    fn query_offset(&self, session_uri: &str, _total: u64) -> Result<ChunkStatus, SyncError> {
        let inner = self.lock();
        match inner.sessions.get(session_uri) {
            Some(session) => Ok(ChunkStatus::Incomplete {
                next_offset: session.received.len() as u64,
            }),
            None => Err(SyncError::Http {
                status: 404,
                body: "unknown session".into(),
            }),
        }
    }

    fn file_metadata(&self, file_id: &str) -> Result<RemoteFileMeta, SyncError> {
        let inner = self.lock();
        let file = inner.files.get(file_id).ok_or_else(|| SyncError::Http {
            status: 404,
            body: format!("no file {file_id}"),
        })?;
        let (sha256, md5) = if self.omit_checksums {
            (None, None)
        } else {
            (
                Some(hashing::sha256_bytes(&file.bytes)),
                Some(hashing::md5_bytes(&file.bytes)),
            )
        };
        Ok(RemoteFileMeta {
            id: file_id.to_string(),
            size: file.bytes.len() as u64,
            sha256,
            md5,
        })
    }

    fn move_entry(&self, entry_id: &str, new_parent_id: &str) -> Result<(), SyncError> {
        let mut inner = self.lock();
        if let Some(folder) = inner.folders.iter_mut().find(|f| f.id == entry_id) {
            folder.parent_id = Some(new_parent_id.to_string());
            return Ok(());
        }
        if let Some(file) = inner.files.get_mut(entry_id) {
            file.parent_id = new_parent_id.to_string();
            return Ok(());
        }
        Err(SyncError::Http {
            status: 404,
            body: format!("no entry {entry_id}"),
        })
    }
}
