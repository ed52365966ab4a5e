//! Crash dump for failed runs: what went wrong plus a snapshot of the host.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::{ArtifactWriter, CRASH_DUMP, SCHEMA_VERSION};
use crate::config::APP_VERSION;
use crate::error::ErrorCategory;

/// Recent errors kept in a dump.
const MAX_RECENT_ERRORS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub os: String,
    pub arch: String,
    pub os_family: String,
    pub tool_version: String,
    pub cpu_count: usize,
    pub disk_free_bytes: Option<u64>,
    pub disk_total_bytes: Option<u64>,
    pub gpu_available: bool,
}

impl EnvironmentInfo {
    /// Probe the host. Disk figures are for the volume holding `dir`.
    pub fn capture(dir: &Path) -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os_family: std::env::consts::FAMILY.to_string(),
            tool_version: APP_VERSION.to_string(),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            disk_free_bytes: fs2::available_space(dir).ok(),
            disk_total_bytes: fs2::total_space(dir).ok(),
            gpu_available: gpu_present(),
        }
    }
}

/// NVIDIA device node or `nvidia-smi` on PATH.
pub fn gpu_present() -> bool {
    if Path::new("/dev/nvidia0").exists() {
        return true;
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        dir.join("nvidia-smi").is_file() || dir.join("nvidia-smi.exe").is_file()
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashDump {
    pub schema_version: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    pub violations: Vec<String>,
    pub error_category: ErrorCategory,
    pub recent_errors: Vec<String>,
    pub environment: EnvironmentInfo,
}

impl CrashDump {
    pub fn new(
        run_id: &str,
        reason: &str,
        category: ErrorCategory,
        violations: Vec<String>,
        recent_errors: &[String],
        created_at: DateTime<Utc>,
        run_dir: &Path,
    ) -> Self {
        let skip = recent_errors.len().saturating_sub(MAX_RECENT_ERRORS);
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run_id.to_string(),
            created_at,
            reason: if reason.is_empty() {
                "unknown".to_string()
            } else {
                reason.to_string()
            },
            violations,
            error_category: category,
            recent_errors: recent_errors[skip..].to_vec(),
            environment: EnvironmentInfo::capture(run_dir),
        }
    }

    pub fn write(&self, writer: &ArtifactWriter) -> std::io::Result<()> {
        writer.write_json(CRASH_DUMP, self)?;
        tracing::warn!(
            run_id = %self.run_id,
            category = %self.error_category,
            reason = %self.reason,
            "Crash dump written"
        );
        Ok(())
    }
}
