//! Content-hash stage cache for resumable runs.
//!
//! Each cached stage records the hash of its inputs and the outputs it wrote.
//! On the next run in the same directory a stage is skipped only when the
//! input hash is unchanged and every recorded output is still on disk with the
//! same content.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifacts::{self, SCHEMA_VERSION, STAGE_CACHE};
use crate::hashing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Computed,
    Skipped,
    Recomputed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutput {
    /// Relative to the run directory.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCacheEntry {
    pub input_hash: String,
    pub outputs: Vec<CachedOutput>,
    pub status: StageStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCacheFile {
    pub schema_version: String,
    pub stages: BTreeMap<String, StageCacheEntry>,
}

impl Default for StageCacheFile {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            stages: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDecision {
    Skip,
    Compute { prior: Option<StageCacheEntry> },
}

/// SHA-256 over the canonical JSON form of a stage's inputs.
pub fn compute_input_hash(payload: &Value) -> String {
    hashing::canonical_json_hash(payload)
}

/// True only if every output exists and matches its recorded hash.
/// An empty output list never matches.
pub fn cache_outputs_match(run_dir: &Path, outputs: &[CachedOutput]) -> bool {
    if outputs.is_empty() {
        return false;
    }
    outputs.iter().all(|output| {
        let path = run_dir.join(&output.path);
        if !path.is_file() {
            return false;
        }
        match &output.sha256 {
            Some(expected) => hashing::sha256_file(&path)
                .map(|actual| &actual == expected)
                .unwrap_or(false),
            None => true,
        }
    })
}

/// Hash freshly written outputs for recording.
pub fn hash_outputs(run_dir: &Path, relative: &[&str]) -> std::io::Result<Vec<CachedOutput>> {
    relative
        .iter()
        .map(|rel| {
            Ok(CachedOutput {
                path: rel.to_string(),
                sha256: Some(hashing::sha256_file(&run_dir.join(rel))?),
            })
        })
        .collect()
}

#[derive(Debug)]
pub struct StageCache {
    run_dir: PathBuf,
    file: StageCacheFile,
}

impl StageCache {
    /// Load `stage_cache.json` from `run_dir`. Unreadable or foreign-version
    /// caches are discarded.
    pub fn load(run_dir: &Path) -> Self {
        let path = run_dir.join(STAGE_CACHE);
        let file = match artifacts::read_json_opt::<StageCacheFile>(&path) {
            Some(f) if f.schema_version == SCHEMA_VERSION => f,
            Some(f) => {
                tracing::warn!(
                    found = %f.schema_version,
                    expected = SCHEMA_VERSION,
                    "Stage cache version mismatch, resetting"
                );
                StageCacheFile::default()
            }
            None => StageCacheFile::default(),
        };
        Self {
            run_dir: run_dir.to_path_buf(),
            file,
        }
    }

    pub fn evaluate(&self, stage: &str, input_hash: &str) -> CacheDecision {
        match self.file.stages.get(stage) {
            Some(entry)
                if entry.input_hash == input_hash
                    && cache_outputs_match(&self.run_dir, &entry.outputs) =>
            {
                CacheDecision::Skip
            }
            prior => CacheDecision::Compute {
                prior: prior.cloned(),
            },
        }
    }

    pub fn mark_skipped(&mut self, stage: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.file.stages.get_mut(stage) {
            entry.status = StageStatus::Skipped;
            entry.updated_at = now;
        }
    }

    /// Record a computed stage. `had_prior` marks it `recomputed`.
    pub fn record(
        &mut self,
        stage: &str,
        input_hash: String,
        outputs: Vec<CachedOutput>,
        had_prior: bool,
        now: DateTime<Utc>,
    ) -> StageStatus {
        let status = if had_prior {
            StageStatus::Recomputed
        } else {
            StageStatus::Computed
        };
        self.file.stages.insert(
            stage.to_string(),
            StageCacheEntry {
                input_hash,
                outputs,
                status,
                updated_at: now,
            },
        );
        status
    }

    /// Drop a stage's entry so the next run computes it again.
    pub fn invalidate(&mut self, stage: &str) -> Option<StageCacheEntry> {
        self.file.stages.remove(stage)
    }

    pub fn entry(&self, stage: &str) -> Option<&StageCacheEntry> {
        self.file.stages.get(stage)
    }

    pub fn file(&self) -> &StageCacheFile {
        &self.file
    }

    pub fn save(&self) -> std::io::Result<()> {
        artifacts::write_json_atomic(&self.run_dir.join(STAGE_CACHE), &self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    #[test]
    fn input_hash_is_key_order_independent() {
        let a = compute_input_hash(&json!({"x": 1, "y": [1, 2]}));
        let b = compute_input_hash(&json!({"y": [1, 2], "x": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn empty_outputs_never_match() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!cache_outputs_match(dir.path(), &[]));
    }

    #[test]
    fn output_without_hash_matches_on_existence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let outputs = vec![CachedOutput {
            path: "a.txt".into(),
            sha256: None,
        }];
        assert!(cache_outputs_match(dir.path(), &outputs));
    }

    #[test]
    fn skip_then_recompute_after_output_change() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cache")).unwrap();
        std::fs::write(dir.path().join("cache/parse_results.json"), "[]").unwrap();
        let hash = compute_input_hash(&json!({"inputs": ["a"]}));

        let mut cache = StageCache::load(dir.path());
        assert_eq!(
            cache.evaluate("parse", &hash),
            CacheDecision::Compute { prior: None }
        );
        let outputs = hash_outputs(dir.path(), &["cache/parse_results.json"]).unwrap();
        assert_eq!(
            cache.record("parse", hash.clone(), outputs, false, now()),
            StageStatus::Computed
        );
        cache.save().unwrap();

        let mut reloaded = StageCache::load(dir.path());
        assert_eq!(reloaded.evaluate("parse", &hash), CacheDecision::Skip);
        reloaded.mark_skipped("parse", now());
        assert_eq!(reloaded.entry("parse").unwrap().status, StageStatus::Skipped);

        std::fs::write(dir.path().join("cache/parse_results.json"), "[1]").unwrap();
        match reloaded.evaluate("parse", &hash) {
            CacheDecision::Compute { prior } => assert!(prior.is_some()),
            other => panic!("expected compute, got {other:?}"),
        }
    }

    #[test]
    fn changed_input_hash_recomputes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("o.txt"), "x").unwrap();
        let mut cache = StageCache::load(dir.path());
        let outputs = hash_outputs(dir.path(), &["o.txt"]).unwrap();
        cache.record("ocr", "h1".into(), outputs.clone(), false, now());
        assert!(matches!(
            cache.evaluate("ocr", "h2"),
            CacheDecision::Compute { prior: Some(_) }
        ));
        assert_eq!(
            cache.record("ocr", "h2".into(), outputs, true, now()),
            StageStatus::Recomputed
        );
    }

    #[test]
    fn invalidated_stage_is_computed_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("o.txt"), "x").unwrap();
        let mut cache = StageCache::load(dir.path());
        let outputs = hash_outputs(dir.path(), &["o.txt"]).unwrap();
        cache.record("parse", "h1".into(), outputs, false, now());
        assert!(cache.invalidate("parse").is_some());
        assert_eq!(
            cache.evaluate("parse", "h1"),
            CacheDecision::Compute { prior: None }
        );
        assert!(cache.invalidate("parse").is_none());
    }

    #[test]
    fn corrupt_cache_file_resets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STAGE_CACHE), "{oops").unwrap();
        let cache = StageCache::load(dir.path());
        assert!(cache.file().stages.is_empty());
    }
}
