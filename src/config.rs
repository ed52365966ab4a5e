//! Run configuration.
//!
//! One strongly-typed object, deserialized once at startup and passed by
//! reference through [`crate::context::OpsContext`]. Every field has an explicit
//! default so partial files are valid. Flat keys from the v1 layout are migrated
//! into their sections at the load boundary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "ingestops";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current configuration layout version.
pub const CONFIG_SCHEMA_VERSION: u32 = 2;

/// Placeholder written in place of secrets in persisted snapshots.
pub const REDACTED: &str = "***redacted***";

/// Default `EnvFilter` directive when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "ingestops_lib=info,warn"
}

/// Base data directory: `<platform data dir>/ingestops`.
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default location of run directories.
pub fn default_runs_dir() -> PathBuf {
    app_data_dir().join("runs")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config schema_version {0} (max {CONFIG_SCHEMA_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// How unprefixed lesson rules and the backlog check are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
    Strict,
    Warn,
}

/// What preflight does when sync is required but the host is offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflinePolicy {
    /// Offline is a hard preflight failure.
    Fail,
    /// Offline is a warning; sync lands in the deferred queue.
    Defer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub schema_version: u32,
    /// Project name; first path segment under the remote root folder.
    pub project: String,
    pub runs_dir: PathBuf,
    /// Queue, lessons and locks. Defaults to `<runs_dir>/_ops`.
    pub state_dir: Option<PathBuf>,
    /// Cancellation marker. Defaults to `<run_dir>/CANCEL`.
    pub cancel_marker: Option<PathBuf>,
    pub extract: ExtractConfig,
    pub preflight: PreflightConfig,
    pub sync: SyncConfig,
    pub auth: AuthConfig,
    pub retention: RetentionConfig,
    pub contract: ContractConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub parse_workers: usize,
    pub ocr_workers: usize,
    pub min_total_chars: usize,
    pub min_chars_per_page: f64,
    pub empty_page_ratio_threshold: f64,
    pub pdftotext_command: String,
    pub ocr_command: String,
    /// Passed to the OCR tool (`normal` or `lite`).
    pub ocr_mode: String,
    pub ocr_device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    pub min_free_disk_mb: u64,
    pub stop_on_preflight_failure: bool,
    pub rule_mode: RuleMode,
    /// `warn` rule mode also downgrades rules explicitly marked `hard:`.
    pub allow_hard_rule_downgrade: bool,
    pub max_sync_queue_backlog: usize,
    pub offline_policy: OfflinePolicy,
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub dry_run: bool,
    pub api_base: String,
    pub upload_base: String,
    pub root_folder_id: String,
    pub chunk_size_bytes: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub verify_remote_checksum: bool,
    pub upload_workers: usize,
    pub lock_ttl_secs: u64,
    /// 0 = a held lock defers immediately.
    pub lock_wait_timeout_ms: u64,
    pub lock_poll_interval_ms: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_endpoint: String,
    /// Defaults to `<state_dir>/token_cache.json`.
    pub token_cache_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub failed_days: i64,
    pub success_days: i64,
    pub trash_days: i64,
    pub max_delete_per_run: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractConfig {
    /// Missing required artifacts are violations.
    pub strict: bool,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            project: "default".into(),
            runs_dir: default_runs_dir(),
            state_dir: None,
            cancel_marker: None,
            extract: ExtractConfig::default(),
            preflight: PreflightConfig::default(),
            sync: SyncConfig::default(),
            auth: AuthConfig::default(),
            retention: RetentionConfig::default(),
            contract: ContractConfig::default(),
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            parse_workers: 4,
            ocr_workers: 2,
            min_total_chars: 200,
            min_chars_per_page: 50.0,
            empty_page_ratio_threshold: 0.5,
            pdftotext_command: "pdftotext".into(),
            ocr_command: "yomitoku".into(),
            ocr_mode: "normal".into(),
            ocr_device: "cpu".into(),
        }
    }
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            min_free_disk_mb: 512,
            stop_on_preflight_failure: true,
            rule_mode: RuleMode::Strict,
            allow_hard_rule_downgrade: true,
            max_sync_queue_backlog: 20,
            offline_policy: OfflinePolicy::Defer,
            probe_timeout_ms: 1500,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: false,
            api_base: "http://localhost:8787/api".into(),
            upload_base: "http://localhost:8787/upload".into(),
            root_folder_id: "root".into(),
            // 8 × 256 KiB; resumable endpoints expect 256 KiB multiples.
            chunk_size_bytes: 8 * 256 * 1024,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            verify_remote_checksum: true,
            upload_workers: 2,
            lock_ttl_secs: 900,
            lock_wait_timeout_ms: 0,
            lock_poll_interval_ms: 200,
            request_timeout_secs: 60,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            refresh_token: None,
            client_id: None,
            client_secret: None,
            token_endpoint: "http://localhost:8787/oauth/token".into(),
            token_cache_path: None,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            failed_days: 14,
            success_days: 30,
            trash_days: 7,
            max_delete_per_run: 20,
            dry_run: false,
        }
    }
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self { strict: true }
    }
}

// ═══════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════

/// Flat v1 keys and their sectioned replacements.
const DEPRECATED_KEYS: &[(&str, &str, &str)] = &[
    ("parse_workers", "extract", "parse_workers"),
    ("ocr_workers", "extract", "ocr_workers"),
    ("preflight_rule_mode", "preflight", "rule_mode"),
    ("offline_policy", "preflight", "offline_policy"),
    ("min_free_disk_mb", "preflight", "min_free_disk_mb"),
    ("drive_enabled", "sync", "enabled"),
    ("drive_folder_id", "sync", "root_folder_id"),
    ("retention_failed_days", "retention", "failed_days"),
    ("retention_success_days", "retention", "success_days"),
    ("access_token", "auth", "access_token"),
];

impl OpsConfig {
    /// Load from a `.toml` or `.json` file (by extension; TOML otherwise).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let config = if is_json {
            Self::from_json_str(&text)?
        } else {
            Self::from_toml_str(&text)?
        };

        tracing::info!(
            path = %path.display(),
            project = %config.project,
            sync_enabled = config.sync.enabled,
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let value: Value = toml::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Migrate deprecated keys, then deserialize and validate.
    pub fn from_value(mut value: Value) -> Result<Self, ConfigError> {
        for note in migrate_deprecated_keys(&mut value) {
            tracing::warn!(migration = %note, "Deprecated config key migrated");
        }
        let config: OpsConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version > CONFIG_SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedVersion(self.schema_version));
        }
        if self.extract.parse_workers == 0 || self.extract.ocr_workers == 0 {
            return Err(ConfigError::Invalid("worker counts must be at least 1".into()));
        }
        if self.sync.upload_workers == 0 {
            return Err(ConfigError::Invalid("sync.upload_workers must be at least 1".into()));
        }
        if self.sync.chunk_size_bytes == 0 {
            return Err(ConfigError::Invalid("sync.chunk_size_bytes must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.extract.empty_page_ratio_threshold) {
            return Err(ConfigError::Invalid(
                "extract.empty_page_ratio_threshold must be within [0, 1]".into(),
            ));
        }
        if self.project.trim().is_empty() || self.project.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "project name {:?} is not a valid folder name",
                self.project
            )));
        }
        Ok(())
    }

    /// Apply `INGESTOPS_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (tests pass a map).
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("INGESTOPS_ACCESS_TOKEN") {
            self.auth.access_token = Some(v);
        }
        if let Some(v) = lookup("INGESTOPS_REFRESH_TOKEN") {
            self.auth.refresh_token = Some(v);
        }
        if let Some(v) = lookup("INGESTOPS_CLIENT_SECRET") {
            self.auth.client_secret = Some(v);
        }
        if let Some(v) = lookup("INGESTOPS_API_BASE") {
            self.sync.api_base = v;
        }
        if let Some(v) = lookup("INGESTOPS_UPLOAD_BASE") {
            self.sync.upload_base = v;
        }
        if let Some(v) = lookup("INGESTOPS_RUNS_DIR") {
            self.runs_dir = PathBuf::from(v);
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.runs_dir.join("_ops"))
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.runs_dir.join("_trash")
    }

    pub fn lessons_path(&self) -> PathBuf {
        self.state_dir().join("lessons.md")
    }

    pub fn sync_queue_dir(&self) -> PathBuf {
        self.state_dir().join("sync_queue")
    }

    pub fn token_cache_path(&self) -> PathBuf {
        self.auth
            .token_cache_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("token_cache.json"))
    }

    pub fn cancel_marker_for(&self, run_dir: &Path) -> PathBuf {
        self.cancel_marker
            .clone()
            .unwrap_or_else(|| run_dir.join("CANCEL"))
    }

    /// Secret values currently configured, for literal redaction.
    pub fn secret_literals(&self) -> Vec<String> {
        [
            &self.auth.access_token,
            &self.auth.refresh_token,
            &self.auth.client_secret,
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect()
    }

    /// Serializable copy with every secret replaced by [`REDACTED`].
    pub fn redacted_snapshot(&self) -> Value {
        let mut copy = self.clone();
        for secret in [
            &mut copy.auth.access_token,
            &mut copy.auth.refresh_token,
            &mut copy.auth.client_secret,
        ] {
            if secret.is_some() {
                *secret = Some(REDACTED.to_string());
            }
        }
        serde_json::to_value(&copy).unwrap_or(Value::Null)
    }
}

/// Move flat v1 keys into their sections. Returns one note per migrated key.
///
/// An explicit sectioned value wins over the deprecated flat key.
pub fn migrate_deprecated_keys(value: &mut Value) -> Vec<String> {
    let mut notes = Vec::new();
    let Some(root) = value.as_object_mut() else {
        return notes;
    };

    for (old_key, section, new_key) in DEPRECATED_KEYS {
        let Some(old_value) = root.remove(*old_key) else {
            continue;
        };
        let entry = root
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        let Some(section_map) = entry.as_object_mut() else {
            notes.push(format!("{old_key}: dropped, `{section}` is not a table"));
            continue;
        };
        if section_map.contains_key(*new_key) {
            notes.push(format!("{old_key}: ignored, {section}.{new_key} already set"));
        } else {
            section_map.insert(new_key.to_string(), old_value);
            notes.push(format!("{old_key} -> {section}.{new_key}"));
        }
    }

    match root.get("schema_version").and_then(Value::as_u64) {
        Some(v) if v >= u64::from(CONFIG_SCHEMA_VERSION) => {}
        _ => {
            root.insert("schema_version".into(), Value::from(CONFIG_SCHEMA_VERSION));
        }
    }

    notes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = OpsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(config.preflight.rule_mode, RuleMode::Strict);
        assert!(!config.sync.enabled);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = OpsConfig::from_toml_str(
            r#"
            project = "papers"
            [extract]
            ocr_workers = 6
            "#,
        )
        .unwrap();
        assert_eq!(config.project, "papers");
        assert_eq!(config.extract.ocr_workers, 6);
        assert_eq!(config.extract.parse_workers, 4);
        assert_eq!(config.retention.failed_days, 14);
    }

    #[test]
    fn deprecated_flat_keys_are_migrated() {
        let config = OpsConfig::from_toml_str(
            r#"
            schema_version = 1
            ocr_workers = 3
            preflight_rule_mode = "warn"
            drive_folder_id = "folder-123"
            drive_enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(config.extract.ocr_workers, 3);
        assert_eq!(config.preflight.rule_mode, RuleMode::Warn);
        assert_eq!(config.sync.root_folder_id, "folder-123");
        assert!(config.sync.enabled);
    }

    #[test]
    fn sectioned_value_wins_over_deprecated_key() {
        let mut value = serde_json::json!({
            "ocr_workers": 9,
            "extract": { "ocr_workers": 2 }
        });
        let notes = migrate_deprecated_keys(&mut value);
        assert_eq!(value["extract"]["ocr_workers"], 2);
        assert!(notes[0].contains("ignored"));
    }

    #[test]
    fn json_config_loads_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.json");
        std::fs::write(&path, r#"{"project": "j", "sync": {"max_retries": 7}}"#).unwrap();
        let config = OpsConfig::load(&path).unwrap();
        assert_eq!(config.project, "j");
        assert_eq!(config.sync.max_retries, 7);
    }

    #[test]
    fn rejects_zero_workers() {
        let err = OpsConfig::from_toml_str("[extract]\nparse_workers = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_future_schema_version() {
        let err = OpsConfig::from_toml_str("schema_version = 99").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(99)));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("INGESTOPS_ACCESS_TOKEN", "tok-123"),
            ("INGESTOPS_API_BASE", "http://remote/api"),
        ]
        .into_iter()
        .collect();
        let mut config = OpsConfig::default();
        config.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.auth.access_token.as_deref(), Some("tok-123"));
        assert_eq!(config.sync.api_base, "http://remote/api");
    }

    #[test]
    fn snapshot_redacts_secrets() {
        let mut config = OpsConfig::default();
        config.auth.access_token = Some("very-secret".into());
        config.auth.client_secret = Some("also-secret".into());
        let snapshot = config.redacted_snapshot().to_string();
        assert!(!snapshot.contains("very-secret"));
        assert!(!snapshot.contains("also-secret"));
        assert!(snapshot.contains(REDACTED));
    }

    #[test]
    fn derived_paths_live_under_runs_dir() {
        let mut config = OpsConfig::default();
        config.runs_dir = PathBuf::from("/data/runs");
        assert_eq!(config.state_dir(), PathBuf::from("/data/runs/_ops"));
        assert_eq!(config.lessons_path(), PathBuf::from("/data/runs/_ops/lessons.md"));
        assert_eq!(config.trash_dir(), PathBuf::from("/data/runs/_trash"));
        assert_eq!(
            config.cancel_marker_for(Path::new("/data/runs/r1")),
            PathBuf::from("/data/runs/r1/CANCEL")
        );
    }
}
