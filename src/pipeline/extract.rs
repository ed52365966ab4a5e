//! Extraction collaborators: embedded-text PDF backends and OCR tools.
//!
//! Both are traits so the orchestrator can run against mocks. The default
//! implementations shell out to `pdftotext` and the `yomitoku` CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ExtractConfig;
use crate::error::ErrorCategory;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF parsing failed: {0}")]
    PdfParsing(String),

    #[error("Text encoding error: {0}")]
    Encoding(String),

    #[error("OCR tool unavailable: {0}")]
    OcrUnavailable(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),

    #[error("Command `{command}` could not be started: {detail}")]
    Spawn { command: String, detail: String },
}

impl ExtractError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) | Self::Spawn { .. } => ErrorCategory::Io,
            Self::PdfParsing(_) | Self::Encoding(_) => ErrorCategory::Parser,
            Self::OcrUnavailable(_) | Self::OcrProcessing(_) => ErrorCategory::Ocr,
        }
    }

    /// Stable class name fed to the needs-OCR decision.
    pub fn exception_class(&self) -> &'static str {
        match self {
            Self::Io(_) => "IoError",
            Self::PdfParsing(_) => "PdfParsingError",
            Self::Encoding(_) => "EncodingError",
            Self::OcrUnavailable(_) => "OcrUnavailableError",
            Self::OcrProcessing(_) => "OcrProcessingError",
            Self::Spawn { .. } => "SpawnError",
        }
    }
}

/// Embedded-text extraction result for one PDF.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PdfExtraction {
    pub text: String,
    pub pages: Vec<String>,
    pub warnings: Vec<String>,
    pub success: bool,
}

impl PdfExtraction {
    pub fn from_pages(pages: Vec<String>) -> Self {
        Self {
            text: pages.join("\n"),
            pages,
            warnings: vec![],
            success: true,
        }
    }

    /// Exception classes implied by the backend's warnings, first seen first.
    pub fn exception_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = Vec::new();
        for class in self.warnings.iter().filter_map(|w| warning_exception_class(w)) {
            if !classes.iter().any(|c| c == class) {
                classes.push(class.to_string());
            }
        }
        classes
    }
}

/// Recorded when the text layer was not valid UTF-8 and had to be replaced.
pub const INVALID_UTF8_WARNING: &str = "invalid UTF-8 in text layer replaced";

/// Map a backend warning onto the exception class it stands for. Warnings
/// that say nothing about a broken text layer map to `None`.
pub fn warning_exception_class(warning: &str) -> Option<&'static str> {
    let lower = warning.to_lowercase();
    if ["utf-8", "utf8", "encoding", "decod"]
        .iter()
        .any(|k| lower.contains(k))
    {
        Some("UnicodeDecodeError")
    } else if ["xref", "syntax", "corrupt", "malformed"]
        .iter()
        .any(|k| lower.contains(k))
    {
        Some("PdfSyntaxError")
    } else {
        None
    }
}

/// PDF text-layer backend.
pub trait PdfBackend: Send + Sync {
    fn name(&self) -> &str;

    fn extract(&self, path: &Path) -> Result<PdfExtraction, ExtractError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    pub text_path: Option<PathBuf>,
    pub returncode: i32,
    pub figure_count: usize,
}

/// External OCR tool.
pub trait OcrTool: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    fn run(&self, input: &Path, output_dir: &Path, mode: &str) -> Result<OcrOutput, ExtractError>;
}

// ═══════════════════════════════════════════════════════════
// pdftotext
// ═══════════════════════════════════════════════════════════

/// Runs `pdftotext -layout <file> -` and splits pages on form feed.
pub struct PdftotextBackend {
    command: String,
}

impl PdftotextBackend {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }
}

impl PdfBackend for PdftotextBackend {
    fn name(&self) -> &str {
        "pdftotext"
    }

    fn extract(&self, path: &Path) -> Result<PdfExtraction, ExtractError> {
        let output = Command::new(&self.command)
            .arg("-layout")
            .args(["-enc", "UTF-8"])
            .arg(path)
            .arg("-")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ExtractError::Spawn {
                command: self.command.clone(),
                detail: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::PdfParsing(format!(
                "{} exited with {}: {}",
                self.command,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let mut warnings = Vec::new();
        let text = match String::from_utf8(output.stdout) {
            Ok(t) => t,
            Err(e) => {
                warnings.push(INVALID_UTF8_WARNING.to_string());
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };

        let mut pages: Vec<String> = text.split('\x0c').map(str::to_string).collect();
        // pdftotext terminates the last page with a form feed too.
        if pages.len() > 1 && pages.last().is_some_and(|p| p.trim().is_empty()) {
            pages.pop();
        }

        tracing::debug!(path = %path.display(), pages = pages.len(), "pdftotext extracted");
        Ok(PdfExtraction {
            text: pages.join("\n"),
            pages,
            warnings,
            success: true,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// yomitoku
// ═══════════════════════════════════════════════════════════

/// Spawns the `yomitoku` CLI, writing Markdown into `output_dir`.
pub struct YomitokuCli {
    command: String,
    device: String,
}

impl YomitokuCli {
    pub fn new(command: &str, device: &str) -> Self {
        Self {
            command: command.to_string(),
            device: device.to_string(),
        }
    }

    pub fn from_config(config: &ExtractConfig) -> Self {
        Self::new(&config.ocr_command, &config.ocr_device)
    }
}

impl OcrTool for YomitokuCli {
    fn name(&self) -> &str {
        "yomitoku"
    }

    fn available(&self) -> bool {
        Command::new(&self.command)
            .arg("--help")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn run(&self, input: &Path, output_dir: &Path, mode: &str) -> Result<OcrOutput, ExtractError> {
        std::fs::create_dir_all(output_dir)?;

        let mut cmd = Command::new(&self.command);
        cmd.arg(input)
            .args(["-f", "md", "-o"])
            .arg(output_dir)
            .args(["-d", &self.device, "--figure"])
            .stdin(Stdio::null());
        if mode == "lite" {
            cmd.arg("--lite");
        }

        let output = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExtractError::OcrUnavailable(format!("{} not found on PATH", self.command))
            } else {
                ExtractError::Spawn {
                    command: self.command.clone(),
                    detail: e.to_string(),
                }
            }
        })?;

        let returncode = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            return Err(ExtractError::OcrProcessing(format!(
                "yomitoku exited with {returncode}: {tail}"
            )));
        }

        let mut md_files: Vec<PathBuf> = std::fs::read_dir(output_dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
            .collect();
        md_files.sort();

        let mut text = String::new();
        for file in &md_files {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&std::fs::read_to_string(file)?);
        }

        let figure_count = std::fs::read_dir(output_dir.join("figures"))
            .map(|entries| entries.flatten().count())
            .unwrap_or(0);

        Ok(OcrOutput {
            text,
            text_path: md_files.first().cloned(),
            returncode,
            figure_count,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Mocks
// ═══════════════════════════════════════════════════════════

/// Mock PDF backend keyed by file name. Unknown files return `default_pages`.
#[derive(Default)]
pub struct MockPdfBackend {
    pages: HashMap<String, Vec<String>>,
    warnings: HashMap<String, Vec<String>>,
    failures: HashMap<String, String>,
    io_failures: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    default_pages: Vec<String>,
    calls: AtomicUsize,
}

impl MockPdfBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_pages(mut self, pages: &[&str]) -> Self {
        self.default_pages = pages.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_pages(mut self, file_name: &str, pages: &[&str]) -> Self {
        self.pages
            .insert(file_name.to_string(), pages.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Fail extraction of `file_name` with a parsing error.
    pub fn with_failure(mut self, file_name: &str, message: &str) -> Self {
        self.failures.insert(file_name.to_string(), message.to_string());
        self
    }

    /// Attach backend warnings to an otherwise successful extraction.
    pub fn with_warnings(mut self, file_name: &str, warnings: &[&str]) -> Self {
        self.warnings
            .insert(file_name.to_string(), warnings.iter().map(|w| w.to_string()).collect());
        self
    }

    /// Fail extraction of `file_name` with an I/O error.
    pub fn with_io_failure(mut self, file_name: &str, message: &str) -> Self {
        self.io_failures.insert(file_name.to_string(), message.to_string());
        self
    }

    pub fn with_delay(mut self, file_name: &str, delay: Duration) -> Self {
        self.delays.insert(file_name.to_string(), delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PdfBackend for MockPdfBackend {
    fn name(&self) -> &str {
        "mock-pdf"
    }

    fn extract(&self, path: &Path) -> Result<PdfExtraction, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = file_key(path);
        if let Some(delay) = self.delays.get(&key) {
            std::thread::sleep(*delay);
        }
        if let Some(message) = self.io_failures.get(&key) {
            return Err(ExtractError::Io(std::io::Error::other(message.clone())));
        }
        if let Some(message) = self.failures.get(&key) {
            return Err(ExtractError::PdfParsing(message.clone()));
        }
        let pages = self
            .pages
            .get(&key)
            .cloned()
            .unwrap_or_else(|| self.default_pages.clone());
        let mut extraction = PdfExtraction::from_pages(pages);
        extraction.warnings = self.warnings.get(&key).cloned().unwrap_or_default();
        Ok(extraction)
    }
}

/// Mock OCR tool. Returns `text` for every file unless a failure is registered.
pub struct MockOcrTool {
    available: bool,
    text: String,
    failures: HashMap<String, String>,
    calls: AtomicUsize,
}

impl MockOcrTool {
    pub fn new(text: &str) -> Self {
        Self {
            available: true,
            text: text.to_string(),
            failures: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new("")
        }
    }

    pub fn with_failure(mut self, file_name: &str, message: &str) -> Self {
        self.failures.insert(file_name.to_string(), message.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrTool for MockOcrTool {
    fn name(&self) -> &str {
        "mock-ocr"
    }

    fn available(&self) -> bool {
        self.available
    }

    fn run(&self, input: &Path, output_dir: &Path, _mode: &str) -> Result<OcrOutput, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available {
            return Err(ExtractError::OcrUnavailable("mock tool disabled".into()));
        }
        if let Some(message) = self.failures.get(&file_key(input)) {
            return Err(ExtractError::OcrProcessing(message.clone()));
        }
        std::fs::create_dir_all(output_dir)?;
        let text_path = output_dir.join(format!("{}.md", file_key(input)));
        std::fs::write(&text_path, &self.text)?;
        Ok(OcrOutput {
            text: self.text.clone(),
            text_path: Some(text_path),
            returncode: 0,
            figure_count: 0,
        })
    }
}

fn file_key(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_categories() {
        assert_eq!(ExtractError::PdfParsing("x".into()).category(), ErrorCategory::Parser);
        assert_eq!(ExtractError::OcrProcessing("x".into()).category(), ErrorCategory::Ocr);
        assert_eq!(
            ExtractError::Io(std::io::Error::other("x")).category(),
            ErrorCategory::Io
        );
    }

    #[test]
    fn parsing_error_class_triggers_ocr_rule() {
        let class = ExtractError::PdfParsing("bad xref".into()).exception_class();
        assert!(crate::pipeline::needs_ocr::is_extraction_exception(class));
        let class = ExtractError::Encoding("bad".into()).exception_class();
        assert!(crate::pipeline::needs_ocr::is_extraction_exception(class));
    }

    #[test]
    fn encoding_warnings_map_to_exception_classes() {
        assert_eq!(
            warning_exception_class(INVALID_UTF8_WARNING),
            Some("UnicodeDecodeError")
        );
        assert_eq!(
            warning_exception_class("Syntax Error: couldn't read xref table"),
            Some("PdfSyntaxError")
        );
        assert_eq!(warning_exception_class("page 3 rotated"), None);

        let mut extraction = PdfExtraction::from_pages(vec!["text".into()]);
        extraction.warnings = vec![
            INVALID_UTF8_WARNING.into(),
            "page 3 rotated".into(),
            "bad encoding on page 4".into(),
        ];
        let classes = extraction.exception_classes();
        assert_eq!(classes, vec!["UnicodeDecodeError".to_string()]);
        assert!(classes
            .iter()
            .all(|c| crate::pipeline::needs_ocr::is_extraction_exception(c)));
    }

    #[test]
    fn missing_pdftotext_is_spawn_error() {
        let backend = PdftotextBackend::new("definitely-not-a-real-binary-xyz");
        let err = backend.extract(Path::new("/tmp/none.pdf")).unwrap_err();
        assert!(matches!(err, ExtractError::Spawn { .. }));
    }

    #[test]
    fn missing_yomitoku_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let tool = YomitokuCli::new("definitely-not-a-real-binary-xyz", "cpu");
        assert!(!tool.available());
        let err = tool
            .run(Path::new("/tmp/none.pdf"), dir.path(), "normal")
            .unwrap_err();
        assert!(matches!(err, ExtractError::OcrUnavailable(_)));
    }

    #[test]
    fn mock_backend_by_file_name() {
        let backend = MockPdfBackend::new()
            .with_default_pages(&["default"])
            .with_pages("a.pdf", &["p1", "p2"])
            .with_failure("b.pdf", "broken");
        let a = backend.extract(Path::new("/in/a.pdf")).unwrap();
        assert_eq!(a.pages, vec!["p1", "p2"]);
        assert!(backend.extract(Path::new("/in/b.pdf")).is_err());
        let c = backend.extract(Path::new("/in/c.pdf")).unwrap();
        assert_eq!(c.text, "default");
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn mock_ocr_writes_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let tool = MockOcrTool::new("recognized");
        let out = tool.run(Path::new("/in/a.pdf"), dir.path(), "normal").unwrap();
        assert_eq!(out.text, "recognized");
        assert!(out.text_path.unwrap().exists());
    }
}
