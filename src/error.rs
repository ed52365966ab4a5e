//! Error taxonomy shared by every stage.
//!
//! Module errors stay local (`ExtractError`, `SyncError`, ...) and roll up into
//! [`OpsError`]. Each error maps onto one [`ErrorCategory`], which drives
//! failure analysis, lesson block rules and the sync queue's human-action flag.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::contract::ContractError;
use crate::file_lock::LockError;
use crate::pipeline::extract::ExtractError;
use crate::retention::RetentionError;
use crate::sync::SyncError;

/// Failure category, derived from message/category inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    Quota,
    Network,
    Parser,
    Ocr,
    Io,
    Unknown,
    ContractViolation,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Quota => "quota",
            Self::Network => "network",
            Self::Parser => "parser",
            Self::Ocr => "ocr",
            Self::Io => "io",
            Self::Unknown => "unknown",
            Self::ContractViolation => "contract_violation",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "auth" => Self::Auth,
            "quota" => Self::Quota,
            "network" => Self::Network,
            "parser" => Self::Parser,
            "ocr" => Self::Ocr,
            "io" => Self::Io,
            "contract_violation" => Self::ContractViolation,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyword table, checked in order. Earlier rows win.
const CATEGORY_KEYWORDS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::ContractViolation,
        &["contract_validation", "contract violation", "missing:", "schema"],
    ),
    (
        ErrorCategory::Auth,
        &["unauthorized", "401", "403", "forbidden", "invalid_grant", "token", "auth"],
    ),
    (
        ErrorCategory::Quota,
        &["quota", "rate limit", "ratelimit", "429", "too many requests", "storage full"],
    ),
    (
        ErrorCategory::Network,
        &[
            "timed out", "timeout", "connection", "dns", "unreachable", "offline", "network",
            "reset by peer",
        ],
    ),
    (ErrorCategory::Ocr, &["ocr", "yomitoku"]),
    (
        ErrorCategory::Parser,
        &["parse", "parser", "pdf", "encoding", "utf-8", "decode", "malformed"],
    ),
    (
        ErrorCategory::Io,
        &["no such file", "permission denied", "disk", "i/o", "io error", "not found"],
    ),
];

/// Classify a free-form error message.
pub fn classify_error(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

#[derive(Error, Debug)]
pub enum OpsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("Retention error: {0}")]
    Retention(#[from] RetentionError),

    #[error("Preflight failed: {0}")]
    Preflight(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Worker failed: {0}")]
    Worker(String),
}

impl OpsError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) => ErrorCategory::Io,
            Self::Json(_) => ErrorCategory::Parser,
            Self::Extract(e) => e.category(),
            Self::Sync(e) => e.category(),
            Self::Contract(_) => ErrorCategory::ContractViolation,
            Self::Lock(_) => ErrorCategory::Io,
            Self::Preflight(msg) => classify_error(msg),
            Self::Config(_) | Self::Retention(_) | Self::Cancelled | Self::Worker(_) => {
                classify_error(&self.to_string())
            }
        }
    }
}

/// Per-item result that aggregates instead of unwinding.
///
/// `Recoverable` degrades one item; `Fatal` marks the item as failed outright.
#[derive(Debug)]
pub enum StepResult<T> {
    Ok(T),
    Recoverable(OpsError),
    Fatal(OpsError),
}

impl<T> StepResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&OpsError> {
        match self {
            Self::Ok(_) => None,
            Self::Recoverable(e) | Self::Fatal(e) => Some(e),
        }
    }
}
