//! Run artifacts: typed records and the writers that put them on disk.
//!
//! Every JSON artifact carries `schema_version` and is written atomically
//! (temp file in the same directory, then rename). JSONL logs are append-only.
//! Serialized text is passed through [`redact_secrets`] before it reaches disk.
//!
//! **Run directory layout**:
//! ```text
//! {runs_dir}/{run_id}/
//!   manifest.json  metrics.json  warnings.json  failure_analysis.json
//!   run_metadata.json  stage_cache.json  trace.jsonl
//!   crash_dump.json        (failed runs)
//!   sync_state.json        (sync client)
//!   warnings.jsonl         (post-commit warnings)
//!   ingestion/text.md  ingestion/text_source.json
//!   ocr/ocr_meta.json  cache/{parse,ocr}_results.json
//! ```

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCategory;
use crate::preflight::PreflightReport;
use crate::redact::redact_secrets;

pub const SCHEMA_VERSION: &str = "1.0";

pub const MANIFEST: &str = "manifest.json";
pub const METRICS: &str = "metrics.json";
pub const WARNINGS: &str = "warnings.json";
pub const WARNINGS_LOG: &str = "warnings.jsonl";
pub const FAILURE_ANALYSIS: &str = "failure_analysis.json";
pub const RUN_METADATA: &str = "run_metadata.json";
pub const SYNC_STATE: &str = "sync_state.json";
pub const TRACE: &str = "trace.jsonl";
pub const STAGE_CACHE: &str = "stage_cache.json";
pub const CRASH_DUMP: &str = "crash_dump.json";
pub const TEXT_MD: &str = "ingestion/text.md";
pub const TEXT_SOURCE: &str = "ingestion/text_source.json";
pub const OCR_META: &str = "ocr/ocr_meta.json";
pub const PARSE_CACHE: &str = "cache/parse_results.json";
pub const OCR_CACHE: &str = "cache/ocr_results.json";

/// Outputs hashed into the manifest and uploaded by the sync client, in order.
pub const MANIFEST_OUTPUTS: &[&str] = &[
    TEXT_MD,
    TEXT_SOURCE,
    OCR_META,
    METRICS,
    WARNINGS,
    FAILURE_ANALYSIS,
];

/// Warning codes.
pub mod codes {
    pub const STAGE_CACHE_RECOMPUTED: &str = "STAGE_CACHE_RECOMPUTED";
    pub const CONTRACT_VALIDATION_FAILED: &str = "CONTRACT_VALIDATION_FAILED";
    pub const PREFLIGHT_WARNING: &str = "PREFLIGHT_WARNING";
    pub const PARSE_FAILED: &str = "PARSE_FAILED";
    pub const OCR_FAILED: &str = "OCR_FAILED";
    pub const OCR_UNAVAILABLE: &str = "OCR_UNAVAILABLE";
    pub const CONTROL_CHARACTERS: &str = "CONTROL_CHARACTERS";
    pub const LONG_WHITESPACE_RUN: &str = "LONG_WHITESPACE_RUN";
    pub const HIGH_NON_PRINTABLE_RATIO: &str = "HIGH_NON_PRINTABLE_RATIO";
    pub const SYNC_FAILED: &str = "SYNC_FAILED";
    pub const SYNC_DEFERRED: &str = "SYNC_DEFERRED";
}

// ═══════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// How a document's final text was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    PdfText,
    OcrYomitoku,
    /// OCR ran and the embedded PDF text was also kept.
    Mixed,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractSummary {
    pub documents: usize,
    pub pdf_text: usize,
    pub ocr: usize,
    pub mixed: usize,
    pub none: usize,
    pub needs_ocr: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsSummary {
    pub status: RunStatus,
    pub preflight_passed: bool,
    pub sync_enabled: bool,
    pub warning_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    pub run_id: String,
    pub project: String,
    pub created_at: DateTime<Utc>,
    pub inputs: Vec<FileEntry>,
    pub outputs: Vec<FileEntry>,
    pub extract: ExtractSummary,
    pub ops: OpsSummary,
    pub committed: bool,
    pub committed_local: bool,
    pub committed_drive: bool,
}

impl Manifest {
    pub fn output(&self, path: &str) -> Option<&FileEntry> {
        self.outputs.iter().find(|o| o.path == path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub schema_version: String,
    pub run_id: String,
    pub documents_total: usize,
    pub documents_failed: usize,
    pub needs_ocr: usize,
    pub ocr_attempted: usize,
    pub ocr_succeeded: usize,
    pub ocr_failed: usize,
    pub total_chars: usize,
    pub mean_empty_page_ratio: f64,
    pub stage_cache_hits: usize,
    pub stage_durations_ms: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

impl Warning {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            stage: None,
            document: None,
        }
    }

    pub fn at_stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_string());
        self
    }

    pub fn for_document(mut self, document: &str) -> Self {
        self.document = Some(document.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningsFile {
    pub schema_version: String,
    pub run_id: String,
    pub warnings: Vec<Warning>,
}

impl WarningsFile {
    pub fn has_code(&self, code: &str) -> bool {
        self.warnings.iter().any(|w| w.code == code)
    }
}

/// One line of `warnings.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningRecord {
    pub schema_version: String,
    pub run_id: String,
    pub recorded_at: DateTime<Utc>,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub schema_version: String,
    pub run_id: String,
    pub status: RunStatus,
    pub category: Option<ErrorCategory>,
    pub root_cause: Option<String>,
    pub recommendation_steps: Vec<String>,
    pub preventive_checks: Vec<String>,
    pub failed_documents: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub schema_version: String,
    pub run_id: String,
    pub project: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tool_version: String,
    pub config: Value,
    pub preflight: PreflightReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSourceEntry {
    pub index: usize,
    pub path: String,
    pub file_name: String,
    pub method: ExtractionMethod,
    pub pages: usize,
    pub chars: usize,
    pub needs_ocr: bool,
    pub reason: String,
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSource {
    pub schema_version: String,
    pub run_id: String,
    pub documents: Vec<TextSourceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrDocumentMeta {
    pub index: usize,
    pub path: String,
    pub success: bool,
    pub returncode: Option<i32>,
    pub figure_count: usize,
    pub chars: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrMeta {
    pub schema_version: String,
    pub run_id: String,
    pub engine: String,
    pub mode: String,
    pub device: String,
    pub available: bool,
    pub documents: Vec<OcrDocumentMeta>,
}

/// One line of `trace.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub schema_version: String,
    pub stage_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ms: i64,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub retry_count: u32,
    pub error: Option<String>,
}

// ═══════════════════════════════════════════════════════════
// Writers
// ═══════════════════════════════════════════════════════════

/// Atomically replace `path` with `bytes`.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Pretty-print `value` and atomically write it to `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let mut json = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    json.push('\n');
    write_bytes_atomic(path, json.as_bytes())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let data = std::fs::read_to_string(path)?;
    serde_json::from_str(&data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Read a JSON artifact if it exists. Unreadable or malformed files are `None`.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match read_json(path) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Unreadable artifact");
            None
        }
    }
}

/// Parse every non-blank line; malformed lines are skipped with a warning.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> std::io::Result<Vec<T>> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut out = Vec::new();
    for (i, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(v) => out.push(v),
            Err(e) => {
                tracing::warn!(path = %path.display(), line = i + 1, error = %e, "Skipping malformed JSONL line");
            }
        }
    }
    Ok(out)
}

/// Writes artifacts below one run directory, redacting secrets on the way.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    run_dir: PathBuf,
    secrets: Vec<String>,
}

impl ArtifactWriter {
    pub fn new(run_dir: &Path, secrets: Vec<String>) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            secrets,
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.run_dir.join(relative)
    }

    pub fn write_json<T: Serialize>(&self, relative: &str, value: &T) -> std::io::Result<PathBuf> {
        let json = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
        let mut redacted = redact_secrets(&json, &self.secrets);
        redacted.push('\n');
        let path = self.path(relative);
        write_bytes_atomic(&path, redacted.as_bytes())?;
        tracing::debug!(path = %path.display(), size = redacted.len(), "Artifact written");
        Ok(path)
    }

    /// Document text is written as-is.
    pub fn write_text(&self, relative: &str, text: &str) -> std::io::Result<PathBuf> {
        let path = self.path(relative);
        write_bytes_atomic(&path, text.as_bytes())?;
        Ok(path)
    }

    pub fn append_jsonl<T: Serialize>(&self, relative: &str, value: &T) -> std::io::Result<()> {
        let line = serde_json::to_string(value).map_err(std::io::Error::other)?;
        let line = redact_secrets(&line, &self.secrets);
        append_line(&self.path(relative), &line)
    }

    /// Replace a JSONL file with `records`, one per line.
    pub fn write_jsonl<T: Serialize>(&self, relative: &str, records: &[T]) -> std::io::Result<()> {
        let mut body = String::new();
        for record in records {
            let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
            body.push_str(&redact_secrets(&line, &self.secrets));
            body.push('\n');
        }
        write_bytes_atomic(&self.path(relative), body.as_bytes())
    }
}

pub fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/a.json");
        write_json_atomic(&path, &serde_json::json!({"v": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"v": 2})).unwrap();
        let back: Value = read_json(&path).unwrap();
        assert_eq!(back["v"], 2);
        // No temp files left behind.
        let entries = std::fs::read_dir(dir.path().join("nested")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn writer_redacts_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), vec!["hunter22".into()]);
        let value = serde_json::json!({
            "error": "401 with Bearer abcdef and key hunter22",
        });
        let path = writer.write_json("x.json", &value).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(!text.contains("abcdef"));
        assert!(!text.contains("hunter22"));
        // Still valid JSON after redaction.
        let _: Value = serde_json::from_str(&text).unwrap();
    }

    #[test]
    fn jsonl_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), vec![]);
        writer.append_jsonl("log.jsonl", &serde_json::json!({"n": 1})).unwrap();
        writer.append_jsonl("log.jsonl", &serde_json::json!({"n": 2})).unwrap();
        let lines: Vec<Value> = read_jsonl(&writer.path("log.jsonl")).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["n"], 2);
    }

    #[test]
    fn read_jsonl_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let lines: Vec<Value> = read_jsonl(&dir.path().join("none.jsonl")).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn read_json_opt_tolerates_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(read_json_opt::<Value>(&path).is_none());
        assert!(read_json_opt::<Value>(&dir.path().join("missing.json")).is_none());
    }

    #[test]
    fn extraction_method_serializes_snake_case() {
        let json = serde_json::to_string(&ExtractionMethod::OcrYomitoku).unwrap();
        assert_eq!(json, "\"ocr_yomitoku\"");
    }
}
