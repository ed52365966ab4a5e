//! Artifact contract validation.
//!
//! Every artifact in a run directory is checked against its embedded JSON
//! Schema before the run may be committed. Violations are plain strings:
//! `missing:<file>`, `<file>: <error>`, `<file>:<line>: <error>`.

pub mod crash_dump;
pub mod schemas;

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use jsonschema::Validator;
use serde_json::Value;
use thiserror::Error;

use crate::artifacts::{
    self, RunMetadata, RunStatus, CRASH_DUMP, FAILURE_ANALYSIS, MANIFEST, METRICS, OCR_META,
    RUN_METADATA, STAGE_CACHE, SYNC_STATE, TEXT_SOURCE, TRACE, WARNINGS, WARNINGS_LOG,
};

#[derive(Error, Debug)]
pub enum ContractError {
    #[error("contract violation: {}", .0.join("; "))]
    Violations(Vec<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema for {file} does not compile: {detail}")]
    Schema { file: String, detail: String },
}

/// Required in strict mode.
pub const REQUIRED_ARTIFACTS: &[&str] = &[
    MANIFEST,
    METRICS,
    WARNINGS,
    FAILURE_ANALYSIS,
    RUN_METADATA,
    STAGE_CACHE,
    TRACE,
    TEXT_SOURCE,
    OCR_META,
];

/// Validated only when present.
pub const OPTIONAL_ARTIFACTS: &[&str] = &[SYNC_STATE, WARNINGS_LOG, CRASH_DUMP];

struct CompiledSchema {
    validator: Validator,
    jsonl: bool,
}

fn compile_all() -> Result<HashMap<&'static str, CompiledSchema>, ContractError> {
    let mut out = HashMap::new();
    for (file, schema, jsonl) in schemas::all() {
        let validator = jsonschema::validator_for(&schema).map_err(|e| ContractError::Schema {
            file: file.to_string(),
            detail: e.to_string(),
        })?;
        out.insert(file, CompiledSchema { validator, jsonl });
    }
    Ok(out)
}

/// Schemas compiled once per process.
fn compiled() -> Result<&'static HashMap<&'static str, CompiledSchema>, ContractError> {
    static COMPILED: OnceLock<Result<HashMap<&'static str, CompiledSchema>, String>> =
        OnceLock::new();
    COMPILED
        .get_or_init(|| compile_all().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|detail| ContractError::Schema {
            file: "*".into(),
            detail: detail.clone(),
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractReport {
    pub checked: Vec<String>,
    pub violations: Vec<String>,
}

impl ContractReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(self) -> Result<Self, ContractError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(ContractError::Violations(self.violations))
        }
    }
}

/// Validate a single in-memory document against the schema for `file`.
pub fn validate_value(file: &str, value: &Value) -> Result<Vec<String>, ContractError> {
    let schemas = compiled()?;
    let Some(compiled) = schemas.get(file) else {
        return Ok(vec![]);
    };
    Ok(compiled
        .validator
        .iter_errors(value)
        .map(|e| format!("{file}: {e}"))
        .collect())
}

fn validate_file(run_dir: &Path, file: &str, report: &mut ContractReport) -> Result<(), ContractError> {
    let schemas = compiled()?;
    let Some(compiled) = schemas.get(file) else {
        return Ok(());
    };
    let text = std::fs::read_to_string(run_dir.join(file))?;
    report.checked.push(file.to_string());

    if compiled.jsonl {
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let line_no = i + 1;
            match serde_json::from_str::<Value>(line) {
                Ok(value) => report.violations.extend(
                    compiled
                        .validator
                        .iter_errors(&value)
                        .map(|e| format!("{file}:{line_no}: {e}")),
                ),
                Err(e) => report
                    .violations
                    .push(format!("{file}:{line_no}: invalid json: {e}")),
            }
        }
    } else {
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => report.violations.extend(
                compiled
                    .validator
                    .iter_errors(&value)
                    .map(|e| format!("{file}: {e}")),
            ),
            Err(e) => report.violations.push(format!("{file}: invalid json: {e}")),
        }
    }
    Ok(())
}

/// Validate every artifact in `run_dir`.
///
/// In strict mode each required artifact must exist. A failed run must carry
/// `crash_dump.json` in either mode.
pub fn validate_run_dir(run_dir: &Path, strict: bool) -> Result<ContractReport, ContractError> {
    let mut report = ContractReport::default();

    for file in REQUIRED_ARTIFACTS {
        if run_dir.join(file).is_file() {
            validate_file(run_dir, file, &mut report)?;
        } else if strict {
            report.violations.push(format!("missing:{file}"));
        }
    }

    for file in OPTIONAL_ARTIFACTS {
        if run_dir.join(file).is_file() {
            validate_file(run_dir, file, &mut report)?;
        }
    }

    let failed = artifacts::read_json_opt::<RunMetadata>(&run_dir.join(RUN_METADATA))
        .is_some_and(|m| m.status == RunStatus::Failed);
    if failed && !run_dir.join(CRASH_DUMP).is_file() {
        report.violations.push(format!("missing:{CRASH_DUMP}"));
    }

    if report.is_valid() {
        tracing::debug!(run_dir = %run_dir.display(), checked = report.checked.len(), "Contracts valid");
    } else {
        tracing::warn!(
            run_dir = %run_dir.display(),
            violations = report.violations.len(),
            first = %report.violations[0],
            "Contract validation failed"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn all_schemas_compile() {
        let schemas = compiled().unwrap();
        assert_eq!(schemas.len(), REQUIRED_ARTIFACTS.len() + OPTIONAL_ARTIFACTS.len());
    }

    #[test]
    fn empty_dir_reports_every_required_file_in_strict_mode() {
        let dir = tempfile::tempdir().unwrap();
        let report = validate_run_dir(dir.path(), true).unwrap();
        for file in REQUIRED_ARTIFACTS {
            assert!(report.violations.contains(&format!("missing:{file}")));
        }
    }

    #[test]
    fn non_strict_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let report = validate_run_dir(dir.path(), false).unwrap();
        assert!(report.is_valid());
    }

    #[test]
    fn malformed_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METRICS), "{broken").unwrap();
        let report = validate_run_dir(dir.path(), false).unwrap();
        assert!(report.violations[0].starts_with("metrics.json: invalid json"));
    }

    #[test]
    fn schema_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(WARNINGS),
            json!({"schema_version": "1.0", "run_id": "r", "warnings": [{"code": "lower"}]}).to_string(),
        )
        .unwrap();
        let report = validate_run_dir(dir.path(), false).unwrap();
        assert!(!report.is_valid());
        assert!(report.violations.iter().all(|v| v.starts_with("warnings.json: ")));
    }

    #[test]
    fn jsonl_errors_carry_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let good = json!({
            "schema_version": "1.0", "stage_id": "parse",
            "start": "2024-01-01T00:00:00Z", "end": "2024-01-01T00:00:00Z",
            "duration_ms": 0, "inputs": [], "outputs": [], "retry_count": 0, "error": null
        });
        let body = format!("{good}\n{{\"stage_id\": \"parse\"}}\n");
        std::fs::write(dir.path().join(TRACE), body).unwrap();
        let report = validate_run_dir(dir.path(), false).unwrap();
        assert!(!report.is_valid());
        assert!(report.violations.iter().all(|v| v.starts_with("trace.jsonl:2: ")));
    }

    #[test]
    fn failed_run_requires_crash_dump_even_when_lenient() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = json!({
            "schema_version": "1.0", "run_id": "r1", "project": "p", "status": "failed",
            "created_at": "2024-01-01T00:00:00Z", "finished_at": "2024-01-01T00:00:00Z",
            "tool_version": "0.0.0", "config": {},
            "preflight": {"passed": true, "checks": [], "errors": [], "warnings": [],
                          "network_profile": "ONLINE"}
        });
        std::fs::write(dir.path().join(RUN_METADATA), metadata.to_string()).unwrap();
        let report = validate_run_dir(dir.path(), false).unwrap();
        assert_eq!(report.violations, vec!["missing:crash_dump.json".to_string()]);
    }

    #[test]
    fn validate_value_accepts_conforming_document() {
        let v = json!({"schema_version": "1.0", "run_id": "r", "warnings": []});
        assert!(validate_value(WARNINGS, &v).unwrap().is_empty());
        let bad = json!({"schema_version": "2.0", "run_id": "r", "warnings": []});
        assert!(!validate_value(WARNINGS, &bad).unwrap().is_empty());
    }

    #[test]
    fn violations_error_joins_messages() {
        let report = ContractReport {
            checked: vec![],
            violations: vec!["missing:a".into(), "missing:b".into()],
        };
        let err = report.into_result().unwrap_err();
        assert_eq!(err.to_string(), "contract violation: missing:a; missing:b");
    }
}
