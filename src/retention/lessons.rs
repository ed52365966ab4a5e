//! Lessons learned from failed runs.
//!
//! `lessons.md` is an append-only Markdown log. Each entry records why a run
//! failed and, optionally, a block rule that preflight enforces on later runs.
//!
//! **Entry format**:
//! ```text
//! ## Lesson <run_id>
//! - recorded_at: 2024-05-01T12:00:00+00:00
//! - category: auth
//! - root_cause: token expired
//! - block_rule: hard:require_auth_token
//! ### Recommendation steps
//! - Refresh credentials
//! ### Preventive checks
//! - check_auth_token
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RetentionError;
use crate::artifacts::{self, FailureAnalysis};
use crate::context::Clock;
use crate::error::ErrorCategory;
use crate::file_lock::{FileLock, LockOptions};

const ENTRY_HEADER: &str = "## Lesson ";
const STEPS_HEADER: &str = "### Recommendation steps";
const CHECKS_HEADER: &str = "### Preventive checks";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonEntry {
    pub run_id: String,
    pub recorded_at: DateTime<Utc>,
    pub category: ErrorCategory,
    pub root_cause: String,
    pub recommendation_steps: Vec<String>,
    pub preventive_checks: Vec<String>,
    pub block_rule: Option<String>,
}

/// Block rule learned from a failure category, if any.
pub fn derive_block_rule(category: ErrorCategory) -> Option<&'static str> {
    match category {
        ErrorCategory::Auth => Some("hard:require_auth_token"),
        ErrorCategory::Network => Some("require_network_online"),
        ErrorCategory::Quota => Some("max_sync_queue_backlog=0"),
        ErrorCategory::Ocr => Some("require_ocr_available"),
        ErrorCategory::Io => Some("min_free_disk_mb=1024"),
        ErrorCategory::Parser => Some("warn:require_inputs_readable"),
        ErrorCategory::ContractViolation | ErrorCategory::Unknown => None,
    }
}

impl LessonEntry {
    pub fn from_failure(analysis: &FailureAnalysis, recorded_at: DateTime<Utc>) -> Self {
        let category = analysis.category.unwrap_or(ErrorCategory::Unknown);
        Self {
            run_id: analysis.run_id.clone(),
            recorded_at,
            category,
            root_cause: analysis
                .root_cause
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            recommendation_steps: analysis.recommendation_steps.clone(),
            preventive_checks: analysis.preventive_checks.clone(),
            block_rule: derive_block_rule(category).map(str::to_string),
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("{ENTRY_HEADER}{}\n", single_line(&self.run_id));
        out.push_str(&format!("- recorded_at: {}\n", self.recorded_at.to_rfc3339()));
        out.push_str(&format!("- category: {}\n", self.category));
        out.push_str(&format!("- root_cause: {}\n", single_line(&self.root_cause)));
        if let Some(rule) = &self.block_rule {
            out.push_str(&format!("- block_rule: {}\n", single_line(rule)));
        }
        out.push_str(STEPS_HEADER);
        out.push('\n');
        for step in &self.recommendation_steps {
            out.push_str(&format!("- {}\n", single_line(step)));
        }
        out.push_str(CHECKS_HEADER);
        out.push('\n');
        for check in &self.preventive_checks {
            out.push_str(&format!("- {}\n", single_line(check)));
        }
        out.push('\n');
        out
    }
}

fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ").trim().to_string()
}

#[derive(Clone, Copy)]
enum Section {
    Fields,
    Steps,
    Checks,
}

/// Parse every entry in a lessons file. Unparseable fragments are skipped.
pub fn parse_lessons(text: &str) -> Vec<LessonEntry> {
    let mut entries = Vec::new();
    let mut current: Option<LessonEntry> = None;
    let mut section = Section::Fields;

    for line in text.lines() {
        let line = line.trim_end();
        if let Some(run_id) = line.strip_prefix(ENTRY_HEADER) {
            entries.extend(current.take());
            current = Some(LessonEntry {
                run_id: run_id.trim().to_string(),
                recorded_at: DateTime::<Utc>::UNIX_EPOCH,
                category: ErrorCategory::Unknown,
                root_cause: String::new(),
                recommendation_steps: vec![],
                preventive_checks: vec![],
                block_rule: None,
            });
            section = Section::Fields;
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if line == STEPS_HEADER {
            section = Section::Steps;
            continue;
        }
        if line == CHECKS_HEADER {
            section = Section::Checks;
            continue;
        }
        let Some(item) = line.strip_prefix("- ") else {
            continue;
        };
        match section {
            Section::Steps => entry.recommendation_steps.push(item.to_string()),
            Section::Checks => entry.preventive_checks.push(item.to_string()),
            Section::Fields => {
                let Some((key, value)) = item.split_once(':') else {
                    continue;
                };
                let value = value.trim();
                match key.trim() {
                    "recorded_at" => {
                        if let Ok(t) = DateTime::parse_from_rfc3339(value) {
                            entry.recorded_at = t.with_timezone(&Utc);
                        }
                    }
                    "category" => entry.category = ErrorCategory::parse(value),
                    "root_cause" => entry.root_cause = value.to_string(),
                    "block_rule" if !value.is_empty() => entry.block_rule = Some(value.to_string()),
                    _ => {}
                }
            }
        }
    }
    entries.extend(current);
    entries
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn lock_options() -> LockOptions {
    LockOptions {
        ttl: Duration::from_secs(60),
        wait_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
    }
}

/// Append one entry under `lessons.md.lock`.
pub fn record_lesson(
    path: &Path,
    entry: &LessonEntry,
    clock: &dyn Clock,
) -> Result<(), RetentionError> {
    let _lock = FileLock::acquire(&lock_path(path), "lessons", lock_options(), clock)?;
    let rendered = entry.render();
    let mut body = std::fs::read_to_string(path).unwrap_or_default();
    if !body.is_empty() && !body.ends_with("\n\n") {
        body.push_str(if body.ends_with('\n') { "\n" } else { "\n\n" });
    }
    body.push_str(&rendered);
    artifacts::write_bytes_atomic(path, body.as_bytes())?;
    tracing::info!(
        run_id = %entry.run_id,
        category = %entry.category,
        block_rule = entry.block_rule.as_deref().unwrap_or("-"),
        "Lesson recorded"
    );
    Ok(())
}

pub fn load_lessons(path: &Path) -> Result<Vec<LessonEntry>, RetentionError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(parse_lessons(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Block rules in file order, first occurrence kept.
pub fn load_block_rules(path: &Path) -> Vec<String> {
    let lessons = match load_lessons(path) {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Lessons unreadable, no block rules");
            return Vec::new();
        }
    };
    let mut rules: Vec<String> = Vec::new();
    for rule in lessons.into_iter().filter_map(|l| l.block_rule) {
        if !rules.contains(&rule) {
            rules.push(rule);
        }
    }
    rules
}

pub fn has_lesson_for(path: &Path, run_id: &str) -> bool {
    load_lessons(path)
        .map(|lessons| lessons.iter().any(|l| l.run_id == run_id))
        .unwrap_or(false)
}

/// Drop `rule` from every entry. Returns how many entries changed.
pub fn remove_block_rule(
    path: &Path,
    rule: &str,
    clock: &dyn Clock,
) -> Result<usize, RetentionError> {
    let _lock = FileLock::acquire(&lock_path(path), "lessons", lock_options(), clock)?;
    let mut lessons = load_lessons(path)?;
    let mut changed = 0;
    for lesson in lessons.iter_mut() {
        if lesson.block_rule.as_deref() == Some(rule) {
            lesson.block_rule = None;
            changed += 1;
        }
    }
    if changed > 0 {
        let body: String = lessons.iter().map(LessonEntry::render).collect();
        artifacts::write_bytes_atomic(path, body.as_bytes())?;
        tracing::info!(rule, entries = changed, "Block rule removed");
    }
    Ok(changed)
}

/// Record a lesson for a failed run directory unless one already exists.
/// Returns true if a new entry was written.
pub fn ensure_lesson_for_run(
    lessons_path: &Path,
    run_dir: &Path,
    run_id: &str,
    clock: &dyn Clock,
) -> Result<bool, RetentionError> {
    if has_lesson_for(lessons_path, run_id) {
        return Ok(false);
    }
    let analysis = artifacts::read_json_opt::<FailureAnalysis>(
        &run_dir.join(artifacts::FAILURE_ANALYSIS),
    )
    .unwrap_or_else(|| FailureAnalysis {
        schema_version: artifacts::SCHEMA_VERSION.to_string(),
        run_id: run_id.to_string(),
        status: artifacts::RunStatus::Failed,
        category: Some(ErrorCategory::Unknown),
        root_cause: Some("failure_analysis.json missing".to_string()),
        recommendation_steps: vec![],
        preventive_checks: vec![],
        failed_documents: vec![],
        errors: vec![],
    });
    let mut entry = LessonEntry::from_failure(&analysis, clock.now());
    entry.run_id = run_id.to_string();
    record_lesson(lessons_path, &entry, clock)?;
    Ok(true)
}
