//! Run orchestrator.
//!
//! Drives one ingestion run through a fixed stage order:
//! `discover_inputs → preflight → parse → decide_ocr → ocr → normalize_text →
//! write_contracts → sync`.
//!
//! Per-document problems are collected as [`StepResult`]s and never unwind past
//! this module; a failed run still leaves a complete, schema-valid artifact set
//! (including `crash_dump.json`). Only I/O failures on the artifacts themselves
//! surface as `Err`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::artifacts::{
    self, codes, ExtractSummary, ExtractionMethod, FailureAnalysis, FileEntry, Manifest, Metrics,
    OcrDocumentMeta, OcrMeta, OpsSummary, RunMetadata, RunStatus, TextSource, TextSourceEntry,
    Warning, WarningRecord, WarningsFile, MANIFEST, MANIFEST_OUTPUTS, METRICS, OCR_CACHE,
    OCR_META, PARSE_CACHE, RUN_METADATA, SCHEMA_VERSION, TEXT_MD, TEXT_SOURCE, TRACE, WARNINGS,
    WARNINGS_LOG, FAILURE_ANALYSIS,
};
use crate::artifacts::ArtifactWriter;
use crate::config::{OfflinePolicy, APP_VERSION};
use crate::context::OpsContext;
use crate::contract::{self, crash_dump::CrashDump};
use crate::error::{ErrorCategory, OpsError, StepResult};
use crate::hashing;
use crate::pipeline::extract::{ExtractError, OcrTool, PdfBackend, PdfExtraction};
use crate::pipeline::needs_ocr::{self, ExtractionQuality, NeedsOcrDecision, NeedsOcrThresholds};
use crate::pipeline::normalize;
use crate::pipeline::stage_cache::{self, CacheDecision, StageCache};
use crate::pipeline::trace::TraceRecorder;
use crate::preflight::network::NetworkProfile;
use crate::preflight::{self, PreflightReport, CHECK_OCR_RUNTIME_AVAILABLE};
use crate::sync::{SyncClient, SyncOutcome, SyncState, SyncStateKind};
use crate::worker_pool::WorkerPool;

pub const STAGE_DISCOVER: &str = "discover_inputs";
pub const STAGE_PREFLIGHT: &str = "preflight";
pub const STAGE_PARSE: &str = "parse";
pub const STAGE_DECIDE_OCR: &str = "decide_ocr";
pub const STAGE_OCR: &str = "ocr";
pub const STAGE_NORMALIZE: &str = "normalize_text";
pub const STAGE_WRITE_CONTRACTS: &str = "write_contracts";
pub const STAGE_SYNC: &str = "sync";

/// Root cause recorded for a run stopped by the cancel marker.
pub const CANCELLED: &str = "cancelled";

// ═══════════════════════════════════════════════════════════
// Request / outcome
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Files and directories; directories expand to their `*.pdf` files.
    pub inputs: Vec<PathBuf>,
    /// Reusing an id resumes in the same run directory.
    pub run_id: Option<String>,
}

impl RunRequest {
    pub fn new(inputs: Vec<PathBuf>) -> Self {
        Self {
            inputs,
            run_id: None,
        }
    }

    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    pub preflight: PreflightReport,
    pub failure: FailureAnalysis,
    pub warnings: Vec<Warning>,
    pub contract_violations: Vec<String>,
    /// `None` when sync is disabled or the run failed.
    pub sync: Option<SyncOutcome>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// `<UTC timestamp>-<8 hex chars>`.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

/// Expand directories to their PDFs (sorted, extension case-insensitive),
/// keep explicit files in the given order, drop duplicates.
pub fn discover_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for path in paths {
        let expanded = if path.is_dir() {
            pdfs_in(path)
        } else {
            vec![path.clone()]
        };
        for p in expanded {
            if seen.insert(p.clone()) {
                out.push(p);
            }
        }
    }
    out
}

fn pdfs_in(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Input directory unreadable");
            return Vec::new();
        }
    };
    let mut pdfs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p
                    .extension()
                    .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case("pdf"))
        })
        .collect();
    pdfs.sort();
    pdfs
}

// ═══════════════════════════════════════════════════════════
// Per-document records
// ═══════════════════════════════════════════════════════════

/// One parse result; the list is cached in `cache/parse_results.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ParsedDocument {
    index: usize,
    path: String,
    file_name: String,
    pages: Vec<String>,
    warnings: Vec<String>,
    error: Option<String>,
    category: Option<ErrorCategory>,
    /// From the parse error, or from backend warnings about the text layer.
    #[serde(default)]
    exception_classes: Vec<String>,
    /// OCR is not attempted for fatal parse errors.
    fatal: bool,
}

impl ParsedDocument {
    fn from_step(index: usize, path: &Path, step: StepResult<PdfExtraction>) -> Self {
        let mut doc = Self {
            index,
            path: path.display().to_string(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            pages: Vec::new(),
            warnings: Vec::new(),
            error: None,
            category: None,
            exception_classes: Vec::new(),
            fatal: false,
        };
        doc.fatal = matches!(step, StepResult::Fatal(_));
        match step {
            StepResult::Ok(extraction) => {
                doc.exception_classes = extraction.exception_classes();
                doc.pages = extraction.pages;
                doc.warnings = extraction.warnings;
            }
            StepResult::Recoverable(e) | StepResult::Fatal(e) => {
                doc.category = Some(e.category());
                doc.exception_classes = vec![match &e {
                    OpsError::Extract(inner) => inner.exception_class().to_string(),
                    _ => "WorkerError".to_string(),
                }];
                doc.error = Some(e.to_string());
            }
        }
        doc
    }

    fn text(&self) -> String {
        self.pages.join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OcrResult {
    index: usize,
    path: String,
    success: bool,
    text: String,
    returncode: Option<i32>,
    figure_count: usize,
    error: Option<String>,
    category: Option<ErrorCategory>,
}

fn parse_one(pdf: &dyn PdfBackend, path: &Path) -> StepResult<PdfExtraction> {
    match pdf.extract(path) {
        Ok(extraction) => StepResult::Ok(extraction),
        Err(e @ ExtractError::Io(_)) => StepResult::Fatal(e.into()),
        Err(e) => StepResult::Recoverable(e.into()),
    }
}

fn ocr_one(tool: &dyn OcrTool, index: usize, path: &Path, out_dir: &Path, mode: &str) -> OcrResult {
    let mut result = OcrResult {
        index,
        path: path.display().to_string(),
        success: false,
        text: String::new(),
        returncode: None,
        figure_count: 0,
        error: None,
        category: None,
    };
    match tool.run(path, out_dir, mode) {
        Ok(output) => {
            result.text = if output.text.is_empty() {
                output
                    .text_path
                    .as_deref()
                    .and_then(|p| std::fs::read_to_string(p).ok())
                    .unwrap_or_default()
            } else {
                output.text
            };
            result.returncode = Some(output.returncode);
            result.figure_count = output.figure_count;
            result.success = output.returncode == 0;
            if !result.success {
                result.error = Some(format!("OCR exited with {}", output.returncode));
                result.category = Some(ErrorCategory::Ocr);
            }
        }
        Err(e) => {
            result.category = Some(e.category());
            result.error = Some(e.to_string());
        }
    }
    result
}

/// Text and method for one document. OCR text wins; embedded text is kept
/// alongside it when there was any.
fn final_text(doc: &ParsedDocument, ocr: Option<&OcrResult>) -> (ExtractionMethod, String) {
    let pdf_text = doc.text();
    let has_pdf = !pdf_text.trim().is_empty();
    match ocr.filter(|o| o.success && !o.text.trim().is_empty()) {
        Some(o) if has_pdf => (ExtractionMethod::Mixed, format!("{pdf_text}\n\n{}", o.text)),
        Some(o) => (ExtractionMethod::OcrYomitoku, o.text.clone()),
        None if has_pdf => (ExtractionMethod::PdfText, pdf_text),
        None => (ExtractionMethod::None, String::new()),
    }
}

/// Failed outright: a parse error OCR did not rescue, or an OCR error.
fn document_failed(doc: &ParsedDocument, ocr: Option<&OcrResult>) -> bool {
    let ocr_ok = ocr.is_some_and(|o| o.success);
    let ocr_err = ocr.is_some_and(|o| !o.success);
    (doc.error.is_some() && !ocr_ok) || ocr_err
}

fn remediation(category: ErrorCategory) -> (Vec<String>, Vec<String>) {
    let (steps, checks): (&[&str], &[&str]) = match category {
        ErrorCategory::Auth => (
            &["Refresh or re-authorize the access token", "Retry queued syncs"],
            &["check_auth_token passes before the next run"],
        ),
        ErrorCategory::Quota => (
            &["Free remote storage or wait out the rate limit", "Drain the sync queue"],
            &["Keep the sync queue backlog at zero"],
        ),
        ErrorCategory::Network => (
            &["Restore connectivity or the VPN", "Retry queued syncs"],
            &["require_network_online"],
        ),
        ErrorCategory::Parser => (
            &["Inspect the failed documents and re-export them as PDF"],
            &["Open inputs in a PDF reader before ingesting"],
        ),
        ErrorCategory::Ocr => (
            &["Install or repair the OCR tool", "Re-run the affected documents"],
            &["require_ocr_available"],
        ),
        ErrorCategory::Io => (
            &["Free disk space and check permissions on the runs directory"],
            &["min_free_disk_mb"],
        ),
        ErrorCategory::ContractViolation => (
            &["Inspect the violations in crash_dump.json", "Fix the artifact writer or schema"],
            &["Run contract validation in CI"],
        ),
        ErrorCategory::Unknown => (&["Inspect crash_dump.json and trace.jsonl"], &[]),
    };
    (
        steps.iter().map(|s| s.to_string()).collect(),
        checks.iter().map(|s| s.to_string()).collect(),
    )
}

// ═══════════════════════════════════════════════════════════
// Run state
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Failure {
    category: ErrorCategory,
    root_cause: String,
}

#[derive(Debug, Default)]
struct StageIo {
    inputs: Vec<String>,
    outputs: Vec<String>,
    retry_count: u32,
    error: Option<String>,
}

/// Text artifacts built from the parse and OCR results.
struct TextBundle {
    markdown: String,
    source: TextSource,
    ocr_meta: OcrMeta,
    issues: Vec<Warning>,
}

struct RunState {
    run_id: String,
    run_dir: PathBuf,
    created_at: DateTime<Utc>,
    writer: ArtifactWriter,
    cache: StageCache,
    requested: Vec<PathBuf>,
    inputs: Vec<PathBuf>,
    input_entries: Vec<FileEntry>,
    preflight: PreflightReport,
    parsed: Vec<ParsedDocument>,
    decisions: Vec<Option<NeedsOcrDecision>>,
    ocr: BTreeMap<usize, OcrResult>,
    ocr_available: Option<bool>,
    text_source: Option<TextSource>,
    parse_hash: Option<String>,
    warnings: Vec<Warning>,
    errors: Vec<String>,
    failure: Option<Failure>,
    /// Remaining extraction stages are skipped.
    halted: bool,
    cache_hits: usize,
}

impl RunState {
    /// The first failure is the root cause; later ones only add errors.
    fn fail(&mut self, category: ErrorCategory, root_cause: String) {
        if self.failure.is_none() {
            tracing::warn!(run_id = %self.run_id, %category, root_cause = %root_cause, "Run failed");
            self.failure = Some(Failure {
                category,
                root_cause,
            });
        }
    }

    fn status(&self) -> RunStatus {
        if self.failure.is_none() {
            RunStatus::Success
        } else {
            RunStatus::Failed
        }
    }

    fn recomputed(&mut self, stage: &str) {
        tracing::info!(stage, "Stage cache stale, recomputed");
        self.warnings.push(
            Warning::new(
                codes::STAGE_CACHE_RECOMPUTED,
                format!("{stage} inputs or outputs changed since the cached run"),
            )
            .at_stage(stage),
        );
    }

    /// Warnings and error lines for documents whose parse failed. Runs on
    /// both fresh and cached parse results.
    fn note_parse_errors(&mut self, parsed: &[ParsedDocument]) {
        for doc in parsed {
            let Some(message) = &doc.error else { continue };
            tracing::warn!(document = %doc.file_name, fatal = doc.fatal, error = %message, "Parse failed");
            self.warnings.push(
                Warning::new(codes::PARSE_FAILED, message.clone())
                    .at_stage(STAGE_PARSE)
                    .for_document(&doc.file_name),
            );
            self.errors.push(format!("{}: {message}", doc.file_name));
        }
    }

    /// Same for OCR; `self.parsed` must already hold the documents.
    fn note_ocr_errors(&mut self, results: &[OcrResult]) {
        for result in results.iter().filter(|r| !r.success) {
            let name = self
                .parsed
                .get(result.index)
                .map(|d| d.file_name.clone())
                .unwrap_or_else(|| result.path.clone());
            let message = result.error.clone().unwrap_or_default();
            tracing::warn!(document = %name, error = %message, "OCR failed");
            self.warnings.push(
                Warning::new(codes::OCR_FAILED, message.clone())
                    .at_stage(STAGE_OCR)
                    .for_document(&name),
            );
            self.errors.push(format!("{name}: {message}"));
        }
    }

    fn file_names(&self) -> Vec<String> {
        self.parsed.iter().map(|d| d.file_name.clone()).collect()
    }

    fn failure_analysis(&self) -> FailureAnalysis {
        let failed_documents = self
            .text_source
            .as_ref()
            .map(|s| {
                s.documents
                    .iter()
                    .filter(|d| d.failed)
                    .map(|d| d.file_name.clone())
                    .collect()
            })
            .unwrap_or_default();
        let (category, root_cause, recommendation_steps, preventive_checks) = match &self.failure {
            Some(f) => {
                let (steps, checks) = remediation(f.category);
                (Some(f.category), Some(f.root_cause.clone()), steps, checks)
            }
            None => (None, None, Vec::new(), Vec::new()),
        };
        FailureAnalysis {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: self.run_id.clone(),
            status: self.status(),
            category,
            root_cause,
            recommendation_steps,
            preventive_checks,
            failed_documents,
            errors: self.errors.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════

pub struct Orchestrator<'a> {
    ctx: &'a OpsContext,
}

impl<'a> Orchestrator<'a> {
    pub fn new(ctx: &'a OpsContext) -> Self {
        Self { ctx }
    }

    /// Run every stage for `request`. Failures inside the run come back as a
    /// `failed` outcome; `Err` means the run directory could not be written.
    pub fn run(&self, request: &RunRequest) -> Result<RunOutcome, OpsError> {
        let now = self.ctx.now();
        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| new_run_id(now));
        let run_dir = self.ctx.config.run_dir(&run_id);
        std::fs::create_dir_all(&run_dir)?;

        let span = tracing::info_span!("run", run_id = %run_id);
        let _guard = span.enter();
        tracing::info!(run_dir = %run_dir.display(), inputs = request.inputs.len(), "Run started");

        let mut run = RunState {
            writer: ArtifactWriter::new(&run_dir, self.ctx.secret_literals()),
            cache: StageCache::load(&run_dir),
            run_id,
            run_dir,
            created_at: now,
            requested: request.inputs.clone(),
            inputs: Vec::new(),
            input_entries: Vec::new(),
            preflight: PreflightReport::default(),
            parsed: Vec::new(),
            decisions: Vec::new(),
            ocr: BTreeMap::new(),
            ocr_available: None,
            text_source: None,
            parse_hash: None,
            warnings: Vec::new(),
            errors: Vec::new(),
            failure: None,
            halted: false,
            cache_hits: 0,
        };
        let mut trace = TraceRecorder::new(Arc::clone(&self.ctx.clock));

        self.stage(&mut trace, STAGE_DISCOVER, || Ok(self.discover(&mut run)))?;
        if self.proceed(&mut run) {
            self.stage(&mut trace, STAGE_PREFLIGHT, || Ok(self.preflight(&mut run)))?;
        }
        if self.proceed(&mut run) {
            self.stage(&mut trace, STAGE_PARSE, || self.parse(&mut run))?;
        }
        if self.proceed(&mut run) {
            self.stage(&mut trace, STAGE_DECIDE_OCR, || Ok(self.decide_ocr(&mut run)))?;
        }
        if self.proceed(&mut run) {
            self.stage(&mut trace, STAGE_OCR, || self.ocr(&mut run))?;
        }
        if self.proceed(&mut run) {
            self.stage(&mut trace, STAGE_NORMALIZE, || self.normalize(&mut run))?;
        }

        // write_contracts: the trace itself is written after its own event.
        let violations = {
            let stage_span = tracing::info_span!("stage", stage_id = STAGE_WRITE_CONTRACTS);
            let _stage = stage_span.enter();
            let timer = trace.start(STAGE_WRITE_CONTRACTS);
            let written = self.write_artifacts(&mut run, &trace, &[]);
            let (outputs, error) = match &written {
                Ok(outputs) => (outputs.clone(), None),
                Err(e) => (Vec::new(), Some(e.to_string())),
            };
            trace.finish(timer, run.file_names(), outputs, 0, error);
            written?;
            run.writer.write_jsonl(TRACE, trace.events())?;
            self.write_run_metadata(&run)?;
            self.validate_contracts(&mut run, &trace)?
        };

        let mut sync = None;
        if self.ctx.config.sync.enabled {
            if run.status() == RunStatus::Success {
                sync = self.sync(&mut run, &mut trace)?;
            } else {
                tracing::info!("Run failed, sync skipped");
            }
        }

        let status = run.status();
        tracing::info!(
            status = status.as_str(),
            warnings = run.warnings.len(),
            cache_hits = run.cache_hits,
            "Run finished"
        );
        Ok(RunOutcome {
            failure: run.failure_analysis(),
            run_id: run.run_id,
            run_dir: run.run_dir,
            status,
            preflight: run.preflight,
            warnings: run.warnings,
            contract_violations: violations,
            sync,
        })
    }

    fn stage(
        &self,
        trace: &mut TraceRecorder,
        stage_id: &str,
        body: impl FnOnce() -> Result<StageIo, OpsError>,
    ) -> Result<(), OpsError> {
        let span = tracing::info_span!("stage", stage_id);
        let _guard = span.enter();
        let timer = trace.start(stage_id);
        match body() {
            Ok(io) => {
                trace.finish(timer, io.inputs, io.outputs, io.retry_count, io.error);
                Ok(())
            }
            Err(e) => {
                trace.finish(timer, Vec::new(), Vec::new(), 0, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// False once the run is halted. Checks the cancel marker between stages.
    fn proceed(&self, run: &mut RunState) -> bool {
        if run.halted {
            return false;
        }
        let marker = self.ctx.config.cancel_marker_for(&run.run_dir);
        if marker.exists() {
            tracing::warn!(marker = %marker.display(), "Cancellation requested");
            run.errors.push(format!("cancel marker present: {}", marker.display()));
            run.fail(ErrorCategory::Unknown, CANCELLED.to_string());
            run.halted = true;
            return false;
        }
        true
    }

    // ───────────────────────────────────────────────────────
    // Stages
    // ───────────────────────────────────────────────────────

    fn discover(&self, run: &mut RunState) -> StageIo {
        run.inputs = discover_inputs(&run.requested);
        run.input_entries = run
            .inputs
            .iter()
            .filter_map(|p| match hashing::digest_file(p) {
                Ok(d) => Some(FileEntry {
                    path: p.display().to_string(),
                    size: d.size,
                    sha256: d.sha256,
                }),
                Err(e) => {
                    tracing::debug!(path = %p.display(), error = %e, "Input not hashed");
                    None
                }
            })
            .collect();
        tracing::info!(documents = run.inputs.len(), "Inputs discovered");
        StageIo {
            inputs: run.requested.iter().map(|p| p.display().to_string()).collect(),
            outputs: run.inputs.iter().map(|p| p.display().to_string()).collect(),
            ..Default::default()
        }
    }

    fn preflight(&self, run: &mut RunState) -> StageIo {
        let report = preflight::run_preflight(self.ctx, &run.inputs);
        for warning in &report.warnings {
            run.warnings
                .push(Warning::new(codes::PREFLIGHT_WARNING, warning.clone()).at_stage(STAGE_PREFLIGHT));
        }
        let mut error = None;
        if !report.passed {
            let detail = report.errors.join("; ");
            run.errors.extend(report.errors.iter().cloned());
            let category = report.failure_category().unwrap_or(ErrorCategory::Unknown);
            run.fail(category, format!("preflight failed: {detail}"));
            if self.ctx.config.preflight.stop_on_preflight_failure {
                run.halted = true;
            }
            error = Some(detail);
        }
        let io = StageIo {
            inputs: run.inputs.iter().map(|p| p.display().to_string()).collect(),
            outputs: report.checks.iter().map(|c| c.name.clone()).collect(),
            error,
            ..Default::default()
        };
        run.preflight = report;
        io
    }

    fn parse(&self, run: &mut RunState) -> Result<StageIo, OpsError> {
        let now = self.ctx.now();
        let input_hash = stage_cache::compute_input_hash(&json!({
            "stage": STAGE_PARSE,
            "backend": self.ctx.pdf.name(),
            "inputs": run.inputs.iter().map(|p| {
                let path = p.display().to_string();
                let sha256 = run.input_entries.iter().find(|e| e.path == path).map(|e| e.sha256.clone());
                json!({ "path": path, "sha256": sha256 })
            }).collect::<Vec<_>>(),
        }));
        let io_inputs: Vec<String> = run.inputs.iter().map(|p| p.display().to_string()).collect();

        let decision = run.cache.evaluate(STAGE_PARSE, &input_hash);
        if decision == CacheDecision::Skip {
            if let Some(parsed) =
                artifacts::read_json_opt::<Vec<ParsedDocument>>(&run.run_dir.join(PARSE_CACHE))
            {
                tracing::info!(documents = parsed.len(), "Parse results reused from cache");
                run.cache.mark_skipped(STAGE_PARSE, now);
                run.cache_hits += 1;
                run.note_parse_errors(&parsed);
                run.parsed = parsed;
                run.parse_hash = Some(input_hash);
                return Ok(StageIo {
                    inputs: io_inputs,
                    outputs: vec![PARSE_CACHE.to_string()],
                    ..Default::default()
                });
            }
        }
        let had_prior = matches!(decision, CacheDecision::Compute { prior: Some(_) })
            || decision == CacheDecision::Skip;

        let mut batch = WorkerPool::new(self.ctx.config.extract.parse_workers)
            .batch::<StepResult<PdfExtraction>>();
        for path in &run.inputs {
            let pdf = Arc::clone(&self.ctx.pdf);
            let path = path.clone();
            batch.submit(move || parse_one(pdf.as_ref(), &path));
        }
        let parsed: Vec<ParsedDocument> = batch
            .join_all()
            .into_iter()
            .zip(&run.inputs)
            .enumerate()
            .map(|(index, (result, path))| {
                let step = result.unwrap_or_else(|e| StepResult::Fatal(OpsError::Worker(e.to_string())));
                ParsedDocument::from_step(index, path, step)
            })
            .collect();

        run.note_parse_errors(&parsed);
        let failed = parsed.iter().filter(|d| d.error.is_some()).count();

        run.writer.write_json(PARSE_CACHE, &parsed)?;
        if parsed.iter().any(|d| d.fatal) {
            // Fatal errors are I/O trouble that may clear up; retry on resume.
            tracing::info!(failed, "Parse results not cached");
            run.cache.invalidate(STAGE_PARSE);
        } else {
            let outputs = stage_cache::hash_outputs(&run.run_dir, &[PARSE_CACHE])?;
            run.cache
                .record(STAGE_PARSE, input_hash.clone(), outputs, had_prior, now);
            if had_prior {
                run.recomputed(STAGE_PARSE);
            }
        }
        tracing::info!(documents = parsed.len(), failed, "Parse complete");
        run.parsed = parsed;
        run.parse_hash = Some(input_hash);

        Ok(StageIo {
            inputs: io_inputs,
            outputs: vec![PARSE_CACHE.to_string()],
            ..Default::default()
        })
    }

    fn decide_ocr(&self, run: &mut RunState) -> StageIo {
        let thresholds = NeedsOcrThresholds::from_config(&self.ctx.config.extract);
        run.decisions = run
            .parsed
            .iter()
            .map(|doc| {
                if doc.fatal {
                    return None;
                }
                let quality =
                    ExtractionQuality::from_pages(&doc.pages, doc.exception_classes.clone());
                let decision = needs_ocr::decide(&quality, &thresholds);
                tracing::debug!(
                    document = %doc.file_name,
                    needs_ocr = decision.needs_ocr,
                    reason = decision.reason.as_str(),
                    "OCR decision"
                );
                Some(decision)
            })
            .collect();
        let needing: Vec<String> = run
            .parsed
            .iter()
            .zip(&run.decisions)
            .filter(|(_, d)| d.as_ref().is_some_and(|d| d.needs_ocr))
            .map(|(doc, _)| doc.file_name.clone())
            .collect();
        tracing::info!(needs_ocr = needing.len(), documents = run.parsed.len(), "OCR decisions made");
        StageIo {
            inputs: run.file_names(),
            outputs: needing,
            ..Default::default()
        }
    }

    fn ocr(&self, run: &mut RunState) -> Result<StageIo, OpsError> {
        let now = self.ctx.now();
        let targets: Vec<usize> = run
            .decisions
            .iter()
            .enumerate()
            .filter(|(_, d)| d.as_ref().is_some_and(|d| d.needs_ocr))
            .map(|(i, _)| i)
            .collect();
        let io_inputs: Vec<String> = targets
            .iter()
            .map(|&i| run.parsed[i].file_name.clone())
            .collect();
        if targets.is_empty() {
            return Ok(StageIo::default());
        }

        let tool = Arc::clone(&self.ctx.ocr);
        let available = tool.available();
        run.ocr_available = Some(available);
        if !available {
            let detail = format!(
                "{} unavailable; {} document(s) need OCR",
                tool.name(),
                targets.len()
            );
            run.preflight
                .record_runtime_failure(CHECK_OCR_RUNTIME_AVAILABLE, &detail);
            run.warnings
                .push(Warning::new(codes::OCR_UNAVAILABLE, detail.clone()).at_stage(STAGE_OCR));
            run.errors.push(format!("{CHECK_OCR_RUNTIME_AVAILABLE}: {detail}"));
            run.fail(
                ErrorCategory::Ocr,
                format!("{CHECK_OCR_RUNTIME_AVAILABLE}: {detail}"),
            );
            return Ok(StageIo {
                inputs: io_inputs,
                error: Some(detail),
                ..Default::default()
            });
        }

        let mode = self.ctx.config.extract.ocr_mode.clone();
        let input_hash = stage_cache::compute_input_hash(&json!({
            "stage": STAGE_OCR,
            "parse": run.parse_hash,
            "tool": tool.name(),
            "mode": mode,
            "targets": targets,
        }));
        let decision = run.cache.evaluate(STAGE_OCR, &input_hash);
        if decision == CacheDecision::Skip {
            if let Some(results) =
                artifacts::read_json_opt::<Vec<OcrResult>>(&run.run_dir.join(OCR_CACHE))
            {
                tracing::info!(documents = results.len(), "OCR results reused from cache");
                run.cache.mark_skipped(STAGE_OCR, now);
                run.cache_hits += 1;
                run.note_ocr_errors(&results);
                run.ocr = results.into_iter().map(|r| (r.index, r)).collect();
                return Ok(StageIo {
                    inputs: io_inputs,
                    outputs: vec![OCR_CACHE.to_string()],
                    ..Default::default()
                });
            }
        }
        let had_prior = matches!(decision, CacheDecision::Compute { prior: Some(_) })
            || decision == CacheDecision::Skip;

        let mut batch = WorkerPool::new(self.ctx.config.extract.ocr_workers).batch::<OcrResult>();
        for &index in &targets {
            let tool = Arc::clone(&tool);
            let path = run.inputs[index].clone();
            let out_dir = run.run_dir.join("ocr").join(format!("{:03}", index + 1));
            let mode = mode.clone();
            batch.submit(move || ocr_one(tool.as_ref(), index, &path, &out_dir, &mode));
        }
        let results: Vec<OcrResult> = batch
            .join_all()
            .into_iter()
            .zip(&targets)
            .map(|(result, &index)| {
                result.unwrap_or_else(|e| OcrResult {
                    index,
                    path: run.inputs[index].display().to_string(),
                    success: false,
                    text: String::new(),
                    returncode: None,
                    figure_count: 0,
                    error: Some(e.to_string()),
                    category: Some(ErrorCategory::Ocr),
                })
            })
            .collect();

        run.note_ocr_errors(&results);

        run.writer.write_json(OCR_CACHE, &results)?;
        let outputs = stage_cache::hash_outputs(&run.run_dir, &[OCR_CACHE])?;
        run.cache.record(STAGE_OCR, input_hash, outputs, had_prior, now);
        if had_prior {
            run.recomputed(STAGE_OCR);
        }
        let succeeded = results.iter().filter(|r| r.success).count();
        tracing::info!(attempted = results.len(), succeeded, "OCR complete");
        run.ocr = results.into_iter().map(|r| (r.index, r)).collect();

        Ok(StageIo {
            inputs: io_inputs,
            outputs: vec![OCR_CACHE.to_string()],
            ..Default::default()
        })
    }

    fn build_texts(&self, run: &RunState) -> TextBundle {
        let mut docs: Vec<&ParsedDocument> = run.parsed.iter().collect();
        docs.sort_by_key(|d| d.index);

        let mut sections = Vec::with_capacity(docs.len());
        let mut entries = Vec::with_capacity(docs.len());
        let mut issues = Vec::new();
        for doc in docs {
            let ocr = run.ocr.get(&doc.index);
            let (method, raw) = final_text(doc, ocr);
            issues.extend(normalize::quality_warnings(&raw).into_iter().map(|issue| {
                Warning::new(issue.code, issue.detail)
                    .at_stage(STAGE_NORMALIZE)
                    .for_document(&doc.file_name)
            }));
            let text = normalize::normalize_text(&raw);
            sections.push(normalize::render_section(doc.index + 1, &doc.file_name, &text));

            let decision = run.decisions.get(doc.index).and_then(|d| d.as_ref());
            entries.push(TextSourceEntry {
                index: doc.index,
                path: doc.path.clone(),
                file_name: doc.file_name.clone(),
                method,
                pages: doc.pages.len(),
                chars: text.chars().count(),
                needs_ocr: decision.is_some_and(|d| d.needs_ocr),
                reason: decision
                    .map(|d| d.reason.as_str().to_string())
                    .unwrap_or_else(|| "parse_failed".to_string()),
                failed: document_failed(doc, ocr),
            });
        }

        let extract = &self.ctx.config.extract;
        let ocr_meta = OcrMeta {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run.run_id.clone(),
            engine: self.ctx.ocr.name().to_string(),
            mode: extract.ocr_mode.clone(),
            device: extract.ocr_device.clone(),
            available: run
                .ocr_available
                .unwrap_or_else(|| self.ctx.ocr.available()),
            documents: run
                .ocr
                .values()
                .map(|r| OcrDocumentMeta {
                    index: r.index,
                    path: r.path.clone(),
                    success: r.success,
                    returncode: r.returncode,
                    figure_count: r.figure_count,
                    chars: r.text.chars().count(),
                    error: r.error.clone(),
                })
                .collect(),
        };

        TextBundle {
            markdown: sections.join("\n"),
            source: TextSource {
                schema_version: SCHEMA_VERSION.to_string(),
                run_id: run.run_id.clone(),
                documents: entries,
            },
            ocr_meta,
            issues,
        }
    }

    fn normalize(&self, run: &mut RunState) -> Result<StageIo, OpsError> {
        let now = self.ctx.now();
        let bundle = self.build_texts(run);
        run.warnings.extend(bundle.issues.iter().cloned());

        let input_hash = stage_cache::compute_input_hash(&json!({
            "stage": STAGE_NORMALIZE,
            "text_sha256": hashing::sha256_bytes(bundle.markdown.as_bytes()),
            "text_source": serde_json::to_value(&bundle.source)?,
        }));
        match run.cache.evaluate(STAGE_NORMALIZE, &input_hash) {
            CacheDecision::Skip => {
                tracing::info!("Normalized text unchanged, reusing");
                run.cache.mark_skipped(STAGE_NORMALIZE, now);
                run.cache_hits += 1;
            }
            CacheDecision::Compute { prior } => {
                run.writer.write_text(TEXT_MD, &bundle.markdown)?;
                run.writer.write_json(TEXT_SOURCE, &bundle.source)?;
                let outputs = stage_cache::hash_outputs(&run.run_dir, &[TEXT_MD, TEXT_SOURCE])?;
                run.cache
                    .record(STAGE_NORMALIZE, input_hash, outputs, prior.is_some(), now);
                if prior.is_some() {
                    run.recomputed(STAGE_NORMALIZE);
                }
            }
        }
        run.writer.write_json(OCR_META, &bundle.ocr_meta)?;

        let failed: Vec<&TextSourceEntry> =
            bundle.source.documents.iter().filter(|d| d.failed).collect();
        if let Some(first) = failed.first() {
            let category = run
                .ocr
                .get(&first.index)
                .filter(|o| !o.success)
                .and_then(|o| o.category)
                .or_else(|| run.parsed.get(first.index).and_then(|d| d.category))
                .unwrap_or(ErrorCategory::Unknown);
            let names: Vec<&str> = failed.iter().map(|d| d.file_name.as_str()).collect();
            let root_cause = format!(
                "{} of {} document(s) failed: {}",
                failed.len(),
                bundle.source.documents.len(),
                names.join(", ")
            );
            run.fail(category, root_cause);
        }

        let io = StageIo {
            inputs: run.file_names(),
            outputs: vec![TEXT_MD.to_string(), TEXT_SOURCE.to_string(), OCR_META.to_string()],
            ..Default::default()
        };
        run.text_source = Some(bundle.source);
        Ok(io)
    }

    // ───────────────────────────────────────────────────────
    // Contracts
    // ───────────────────────────────────────────────────────

    fn metrics(&self, run: &RunState, trace: &TraceRecorder) -> Metrics {
        let entries = run
            .text_source
            .as_ref()
            .map(|s| s.documents.as_slice())
            .unwrap_or_default();
        let ratios: Vec<f64> = run
            .parsed
            .iter()
            .filter(|d| !d.fatal && !d.pages.is_empty())
            .map(|d| needs_ocr::page_metrics(&d.pages).empty_page_ratio)
            .collect();
        let mean_empty_page_ratio = if ratios.is_empty() {
            0.0
        } else {
            (ratios.iter().sum::<f64>() / ratios.len() as f64).clamp(0.0, 1.0)
        };
        Metrics {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run.run_id.clone(),
            documents_total: run.inputs.len(),
            documents_failed: entries.iter().filter(|d| d.failed).count(),
            needs_ocr: run
                .decisions
                .iter()
                .filter(|d| d.as_ref().is_some_and(|d| d.needs_ocr))
                .count(),
            ocr_attempted: run.ocr.len(),
            ocr_succeeded: run.ocr.values().filter(|r| r.success).count(),
            ocr_failed: run.ocr.values().filter(|r| !r.success).count(),
            total_chars: entries.iter().map(|d| d.chars).sum(),
            mean_empty_page_ratio,
            stage_cache_hits: run.cache_hits,
            stage_durations_ms: trace.durations_ms(),
        }
    }

    fn extract_summary(&self, run: &RunState) -> ExtractSummary {
        let mut summary = ExtractSummary {
            documents: run.inputs.len(),
            ..Default::default()
        };
        if let Some(source) = &run.text_source {
            for doc in &source.documents {
                match doc.method {
                    ExtractionMethod::PdfText => summary.pdf_text += 1,
                    ExtractionMethod::OcrYomitoku => summary.ocr += 1,
                    ExtractionMethod::Mixed => summary.mixed += 1,
                    ExtractionMethod::None => summary.none += 1,
                }
                summary.needs_ocr += usize::from(doc.needs_ocr);
                summary.failed += usize::from(doc.failed);
            }
        }
        summary
    }

    fn manifest(&self, run: &RunState) -> Result<Manifest, OpsError> {
        let outputs = MANIFEST_OUTPUTS
            .iter()
            .map(|rel| {
                let digest = hashing::digest_file(&run.run_dir.join(rel))?;
                Ok(FileEntry {
                    path: rel.to_string(),
                    size: digest.size,
                    sha256: digest.sha256,
                })
            })
            .collect::<Result<Vec<_>, std::io::Error>>()?;
        let status = run.status();
        let committed = status == RunStatus::Success;
        Ok(Manifest {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run.run_id.clone(),
            project: self.ctx.config.project.clone(),
            created_at: run.created_at,
            inputs: run.input_entries.clone(),
            outputs,
            extract: self.extract_summary(run),
            ops: OpsSummary {
                status,
                preflight_passed: run.preflight.passed,
                sync_enabled: self.ctx.config.sync.enabled,
                warning_count: run.warnings.len(),
            },
            committed,
            committed_local: committed,
            committed_drive: false,
        })
    }

    /// Metrics, warnings, failure analysis, manifest, stage cache and (for a
    /// failed run) the crash dump. Returns the files written.
    fn write_artifacts(
        &self,
        run: &mut RunState,
        trace: &TraceRecorder,
        violations: &[String],
    ) -> Result<Vec<String>, OpsError> {
        if run.text_source.is_none() {
            // Halted before normalize_text; keep the text artifacts present.
            let bundle = self.build_texts(run);
            run.writer.write_text(TEXT_MD, &bundle.markdown)?;
            run.writer.write_json(TEXT_SOURCE, &bundle.source)?;
            run.writer.write_json(OCR_META, &bundle.ocr_meta)?;
            run.text_source = Some(bundle.source);
        }

        run.writer.write_json(METRICS, &self.metrics(run, trace))?;
        run.writer.write_json(
            WARNINGS,
            &WarningsFile {
                schema_version: SCHEMA_VERSION.to_string(),
                run_id: run.run_id.clone(),
                warnings: run.warnings.clone(),
            },
        )?;
        let analysis = run.failure_analysis();
        run.writer.write_json(FAILURE_ANALYSIS, &analysis)?;
        let manifest = self.manifest(run)?;
        run.writer.write_json(MANIFEST, &manifest)?;
        run.cache.save()?;

        let mut written: Vec<String> = [METRICS, WARNINGS, FAILURE_ANALYSIS, MANIFEST, artifacts::STAGE_CACHE]
            .iter()
            .map(|s| s.to_string())
            .collect();

        if let Some(failure) = &run.failure {
            let dump = CrashDump::new(
                &run.run_id,
                &failure.root_cause,
                failure.category,
                violations.to_vec(),
                &run.errors,
                self.ctx.now(),
                &run.run_dir,
            );
            dump.write(&run.writer)?;
            written.push(artifacts::CRASH_DUMP.to_string());
        }
        Ok(written)
    }

    fn write_run_metadata(&self, run: &RunState) -> Result<(), OpsError> {
        let metadata = RunMetadata {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run.run_id.clone(),
            project: self.ctx.config.project.clone(),
            status: run.status(),
            created_at: run.created_at,
            finished_at: self.ctx.now(),
            tool_version: APP_VERSION.to_string(),
            config: self.ctx.config.redacted_snapshot(),
            preflight: run.preflight.clone(),
        };
        run.writer.write_json(RUN_METADATA, &metadata)?;
        Ok(())
    }

    /// Validate the run directory. Violations flip the run to failed and the
    /// affected artifacts are rewritten alongside a crash dump.
    fn validate_contracts(
        &self,
        run: &mut RunState,
        trace: &TraceRecorder,
    ) -> Result<Vec<String>, OpsError> {
        let violations =
            match contract::validate_run_dir(&run.run_dir, self.ctx.config.contract.strict) {
                Ok(report) => report.violations,
                Err(e) => vec![format!("contract validation could not run: {e}")],
            };
        if violations.is_empty() {
            return Ok(violations);
        }

        run.warnings.push(
            Warning::new(
                codes::CONTRACT_VALIDATION_FAILED,
                format!("{} violation(s); first: {}", violations.len(), violations[0]),
            )
            .at_stage(STAGE_WRITE_CONTRACTS),
        );
        run.errors.extend(violations.iter().cloned());
        run.fail(
            ErrorCategory::ContractViolation,
            format!("contract validation failed: {}", violations[0]),
        );
        self.write_artifacts(run, trace, &violations)?;
        self.write_run_metadata(run)?;
        Ok(violations)
    }

    // ───────────────────────────────────────────────────────
    // Sync
    // ───────────────────────────────────────────────────────

    /// Sync never changes the run status; problems go to `warnings.jsonl`.
    fn sync(
        &self,
        run: &mut RunState,
        trace: &mut TraceRecorder,
    ) -> Result<Option<SyncOutcome>, OpsError> {
        let span = tracing::info_span!("stage", stage_id = STAGE_SYNC);
        let _guard = span.enter();
        let timer = trace.start(STAGE_SYNC);

        let client = SyncClient::new(self.ctx);
        let offline = run.preflight.network_profile == NetworkProfile::Offline;
        let result = if offline && self.ctx.config.preflight.offline_policy == OfflinePolicy::Defer {
            client.defer(&run.run_dir, "offline")
        } else {
            client.sync_run(&run.run_dir)
        };

        let (code, message) = match &result {
            Ok(o) if o.state == SyncStateKind::Deferred => (
                Some(codes::SYNC_DEFERRED),
                o.error.clone().unwrap_or_else(|| "deferred".to_string()),
            ),
            Ok(o) if o.state == SyncStateKind::Failed => (
                Some(codes::SYNC_FAILED),
                o.error.clone().unwrap_or_else(|| "failed".to_string()),
            ),
            Ok(o) => (None, o.state.to_string()),
            Err(e) => (Some(codes::SYNC_FAILED), e.to_string()),
        };
        if let Some(code) = code {
            tracing::warn!(code, message = %message, "Sync did not commit");
            run.writer.append_jsonl(
                WARNINGS_LOG,
                &WarningRecord {
                    schema_version: SCHEMA_VERSION.to_string(),
                    run_id: run.run_id.clone(),
                    recorded_at: self.ctx.now(),
                    code: code.to_string(),
                    message: message.clone(),
                },
            )?;
        }

        let retries = SyncState::load(&run.run_dir).map(|s| s.retries).unwrap_or(0);
        let uploaded = result
            .as_ref()
            .map(|o| o.uploaded.clone())
            .unwrap_or_default();
        trace.finish(
            timer,
            MANIFEST_OUTPUTS.iter().map(|s| s.to_string()).collect(),
            uploaded,
            retries,
            code.map(|_| message),
        );
        if let Some(event) = trace.events().last() {
            run.writer.append_jsonl(TRACE, event)?;
        }
        Ok(result.ok())
    }
}
