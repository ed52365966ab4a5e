//! Embedded JSON Schemas, one per artifact file name.

use serde_json::{json, Value};

use crate::artifacts::{
    CRASH_DUMP, FAILURE_ANALYSIS, MANIFEST, METRICS, OCR_META, RUN_METADATA, STAGE_CACHE,
    SYNC_STATE, TEXT_SOURCE, TRACE, WARNINGS, WARNINGS_LOG,
};

const DRAFT: &str = "https://json-schema.org/draft/2020-12/schema";

fn version() -> Value {
    json!({ "const": crate::artifacts::SCHEMA_VERSION })
}

fn timestamp() -> Value {
    json!({ "type": "string", "minLength": 1 })
}

fn sha256() -> Value {
    json!({ "type": "string", "pattern": "^[0-9a-f]{64}$" })
}

fn strings() -> Value {
    json!({ "type": "array", "items": { "type": "string" } })
}

fn count() -> Value {
    json!({ "type": "integer", "minimum": 0 })
}

fn ratio() -> Value {
    json!({ "type": "number", "minimum": 0, "maximum": 1 })
}

fn nullable_string() -> Value {
    json!({ "type": ["string", "null"] })
}

fn category() -> Value {
    json!({
        "enum": ["auth", "quota", "network", "parser", "ocr", "io", "unknown", "contract_violation"]
    })
}

fn file_entry() -> Value {
    json!({
        "type": "object",
        "required": ["path", "size", "sha256"],
        "properties": { "path": { "type": "string", "minLength": 1 }, "size": count(), "sha256": sha256() }
    })
}

fn manifest() -> Value {
    json!({
        "$schema": DRAFT,
        "type": "object",
        "required": ["schema_version", "run_id", "project", "created_at", "inputs", "outputs",
                     "extract", "ops", "committed", "committed_local", "committed_drive"],
        "properties": {
            "schema_version": version(),
            "run_id": { "type": "string", "minLength": 1 },
            "project": { "type": "string", "minLength": 1 },
            "created_at": timestamp(),
            "inputs": { "type": "array", "items": file_entry() },
            "outputs": { "type": "array", "items": file_entry() },
            "extract": {
                "type": "object",
                "required": ["documents", "pdf_text", "ocr", "mixed", "none", "needs_ocr", "failed"],
                "properties": {
                    "documents": count(), "pdf_text": count(), "ocr": count(), "mixed": count(),
                    "none": count(), "needs_ocr": count(), "failed": count()
                }
            },
            "ops": {
                "type": "object",
                "required": ["status", "preflight_passed", "sync_enabled"],
                "properties": {
                    "status": { "enum": ["success", "failed"] },
                    "preflight_passed": { "type": "boolean" },
                    "sync_enabled": { "type": "boolean" },
                    "warning_count": count()
                }
            },
            "committed": { "type": "boolean" },
            "committed_local": { "type": "boolean" },
            "committed_drive": { "type": "boolean" }
        }
    })
}

fn metrics() -> Value {
    json!({
        "$schema": DRAFT,
        "type": "object",
        "required": ["schema_version", "run_id", "documents_total", "documents_failed", "needs_ocr",
                     "ocr_attempted", "ocr_succeeded", "ocr_failed", "total_chars",
                     "mean_empty_page_ratio", "stage_durations_ms"],
        "properties": {
            "schema_version": version(),
            "run_id": { "type": "string" },
            "documents_total": count(),
            "documents_failed": count(),
            "needs_ocr": count(),
            "ocr_attempted": count(),
            "ocr_succeeded": count(),
            "ocr_failed": count(),
            "total_chars": count(),
            "mean_empty_page_ratio": ratio(),
            "stage_cache_hits": count(),
            "stage_durations_ms": { "type": "object", "additionalProperties": count() }
        }
    })
}

fn warnings() -> Value {
    json!({
        "$schema": DRAFT,
        "type": "object",
        "required": ["schema_version", "run_id", "warnings"],
        "properties": {
            "schema_version": version(),
            "run_id": { "type": "string" },
            "warnings": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["code", "message"],
                    "properties": {
                        "code": { "type": "string", "pattern": "^[A-Z][A-Z0-9_]*$" },
                        "message": { "type": "string" },
                        "stage": { "type": "string" },
                        "document": { "type": "string" }
                    }
                }
            }
        }
    })
}

fn warning_record() -> Value {
    json!({
        "$schema": DRAFT,
        "type": "object",
        "required": ["schema_version", "run_id", "recorded_at", "code", "message"],
        "properties": {
            "schema_version": version(),
            "run_id": { "type": "string" },
            "recorded_at": timestamp(),
            "code": { "type": "string", "pattern": "^[A-Z][A-Z0-9_]*$" },
            "message": { "type": "string" }
        }
    })
}

fn failure_analysis() -> Value {
    json!({
        "$schema": DRAFT,
        "type": "object",
        "required": ["schema_version", "run_id", "status", "category", "root_cause",
                     "recommendation_steps", "preventive_checks", "failed_documents", "errors"],
        "properties": {
            "schema_version": version(),
            "run_id": { "type": "string" },
            "status": { "enum": ["success", "failed"] },
            "category": { "anyOf": [category(), { "type": "null" }] },
            "root_cause": nullable_string(),
            "recommendation_steps": strings(),
            "preventive_checks": strings(),
            "failed_documents": strings(),
            "errors": strings()
        },
        "if": { "properties": { "status": { "const": "failed" } } },
        "then": { "properties": { "category": category(), "root_cause": { "type": "string" } } }
    })
}

fn run_metadata() -> Value {
    json!({
        "$schema": DRAFT,
        "type": "object",
        "required": ["schema_version", "run_id", "project", "status", "created_at", "finished_at",
                     "tool_version", "config", "preflight"],
        "properties": {
            "schema_version": version(),
            "run_id": { "type": "string", "minLength": 1 },
            "project": { "type": "string" },
            "status": { "enum": ["success", "failed"] },
            "created_at": timestamp(),
            "finished_at": timestamp(),
            "tool_version": { "type": "string" },
            "config": { "type": "object" },
            "preflight": {
                "type": "object",
                "required": ["passed", "checks", "errors", "warnings", "network_profile"],
                "properties": {
                    "passed": { "type": "boolean" },
                    "checks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["name", "ok", "detail", "hard", "configured_hard"],
                            "properties": {
                                "name": { "type": "string" },
                                "ok": { "type": "boolean" },
                                "detail": { "type": "string" },
                                "hard": { "type": "boolean" },
                                "configured_hard": { "type": "boolean" }
                            }
                        }
                    },
                    "errors": strings(),
                    "warnings": strings(),
                    "network_profile": { "enum": ["ONLINE", "VPN", "OFFLINE", "UNKNOWN"] }
                }
            }
        }
    })
}

fn sync_state() -> Value {
    json!({
        "$schema": DRAFT,
        "type": "object",
        "required": ["schema_version", "run_id", "state", "uploaded_files", "pending_files",
                     "failed_files", "retries", "resume_count", "last_error", "warnings", "updated_at"],
        "properties": {
            "schema_version": version(),
            "run_id": { "type": "string" },
            "state": {
                "enum": ["not_started", "pending", "uploading", "verifying", "committed", "failed", "deferred"]
            },
            "uploaded_files": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["path", "size", "sha256", "md5", "verified", "attempts"],
                    "properties": {
                        "path": { "type": "string" },
                        "size": count(),
                        "sha256": sha256(),
                        "md5": { "type": "string" },
                        "file_id": nullable_string(),
                        "session_uri": nullable_string(),
                        "verified": { "type": "boolean" },
                        "attempts": count()
                    }
                }
            },
            "pending_files": strings(),
            "failed_files": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["path", "attempts", "error"],
                    "properties": {
                        "path": { "type": "string" },
                        "attempts": count(),
                        "error": { "type": "string" }
                    }
                }
            },
            "retries": count(),
            "resume_count": count(),
            "last_error": nullable_string(),
            "remote_root_folder_id": nullable_string(),
            "remote_run_folder_id": nullable_string(),
            "warnings": strings(),
            "updated_at": timestamp()
        }
    })
}

fn trace_event() -> Value {
    json!({
        "$schema": DRAFT,
        "type": "object",
        "required": ["schema_version", "stage_id", "start", "end", "duration_ms", "inputs",
                     "outputs", "retry_count", "error"],
        "properties": {
            "schema_version": version(),
            "stage_id": {
                "enum": ["discover_inputs", "preflight", "parse", "decide_ocr", "ocr",
                         "normalize_text", "write_contracts", "sync"]
            },
            "start": timestamp(),
            "end": timestamp(),
            "duration_ms": count(),
            "inputs": strings(),
            "outputs": strings(),
            "retry_count": count(),
            "error": nullable_string()
        }
    })
}

fn stage_cache() -> Value {
    json!({
        "$schema": DRAFT,
        "type": "object",
        "required": ["schema_version", "stages"],
        "properties": {
            "schema_version": version(),
            "stages": {
                "type": "object",
                "additionalProperties": {
                    "type": "object",
                    "required": ["input_hash", "outputs", "status", "updated_at"],
                    "properties": {
                        "input_hash": sha256(),
                        "outputs": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["path"],
                                "properties": { "path": { "type": "string" }, "sha256": sha256() }
                            }
                        },
                        "status": { "enum": ["computed", "skipped", "recomputed"] },
                        "updated_at": timestamp()
                    }
                }
            }
        }
    })
}

fn crash_dump() -> Value {
    json!({
        "$schema": DRAFT,
        "type": "object",
        "required": ["schema_version", "run_id", "created_at", "reason", "violations",
                     "error_category", "recent_errors", "environment"],
        "properties": {
            "schema_version": version(),
            "run_id": { "type": "string" },
            "created_at": timestamp(),
            "reason": { "type": "string", "minLength": 1 },
            "violations": strings(),
            "error_category": category(),
            "recent_errors": strings(),
            "environment": {
                "type": "object",
                "required": ["os", "arch", "os_family", "tool_version", "cpu_count", "gpu_available"],
                "properties": {
                    "os": { "type": "string" },
                    "arch": { "type": "string" },
                    "os_family": { "type": "string" },
                    "tool_version": { "type": "string" },
                    "cpu_count": count(),
                    "disk_free_bytes": { "type": ["integer", "null"], "minimum": 0 },
                    "disk_total_bytes": { "type": ["integer", "null"], "minimum": 0 },
                    "gpu_available": { "type": "boolean" }
                }
            }
        }
    })
}

fn text_source() -> Value {
    json!({
        "$schema": DRAFT,
        "type": "object",
        "required": ["schema_version", "run_id", "documents"],
        "properties": {
            "schema_version": version(),
            "run_id": { "type": "string" },
            "documents": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["index", "path", "file_name", "method", "pages", "chars",
                                 "needs_ocr", "reason", "failed"],
                    "properties": {
                        "index": count(),
                        "path": { "type": "string" },
                        "file_name": { "type": "string" },
                        "method": { "enum": ["pdf_text", "ocr_yomitoku", "mixed", "none"] },
                        "pages": count(),
                        "chars": count(),
                        "needs_ocr": { "type": "boolean" },
                        "reason": { "type": "string" },
                        "failed": { "type": "boolean" }
                    }
                }
            }
        }
    })
}

fn ocr_meta() -> Value {
    json!({
        "$schema": DRAFT,
        "type": "object",
        "required": ["schema_version", "run_id", "engine", "mode", "device", "available", "documents"],
        "properties": {
            "schema_version": version(),
            "run_id": { "type": "string" },
            "engine": { "type": "string" },
            "mode": { "type": "string" },
            "device": { "type": "string" },
            "available": { "type": "boolean" },
            "documents": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["index", "path", "success", "returncode", "figure_count", "chars", "error"],
                    "properties": {
                        "index": count(),
                        "path": { "type": "string" },
                        "success": { "type": "boolean" },
                        "returncode": { "type": ["integer", "null"] },
                        "figure_count": count(),
                        "chars": count(),
                        "error": nullable_string()
                    }
                }
            }
        }
    })
}

/// `(file name, schema, one document per line)`.
pub fn all() -> Vec<(&'static str, Value, bool)> {
    vec![
        (MANIFEST, manifest(), false),
        (METRICS, metrics(), false),
        (WARNINGS, warnings(), false),
        (WARNINGS_LOG, warning_record(), true),
        (FAILURE_ANALYSIS, failure_analysis(), false),
        (RUN_METADATA, run_metadata(), false),
        (SYNC_STATE, sync_state(), false),
        (TRACE, trace_event(), true),
        (STAGE_CACHE, stage_cache(), false),
        (CRASH_DUMP, crash_dump(), false),
        (TEXT_SOURCE, text_source(), false),
        (OCR_META, ocr_meta(), false),
    ]
}
