//! Backlog of runs whose sync was deferred or failed.
//!
//! One JSON file per run under `<state_dir>/sync_queue/`. Items flagged
//! `human_action_required` wait for someone to fix credentials, sharing or
//! duplicate folders; the rest are retried automatically.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::client::{SyncClient, SyncOutcome};
use super::SyncError;
use crate::artifacts;
use crate::context::OpsContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub enqueued_at: DateTime<Utc>,
    pub reason: String,
    pub attempts: u32,
    pub human_action_required: bool,
    pub last_error: Option<String>,
}

pub struct SyncQueue {
    dir: PathBuf,
}

impl SyncQueue {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    pub fn get(&self, run_id: &str) -> Option<SyncQueueItem> {
        artifacts::read_json_opt(&self.path_for(run_id))
    }

    /// Add or refresh the entry for a run. `enqueued_at` is kept; attempts grow.
    pub fn upsert(
        &self,
        run_id: &str,
        run_dir: &Path,
        reason: &str,
        last_error: Option<String>,
        human_action_required: bool,
        now: DateTime<Utc>,
    ) -> std::io::Result<SyncQueueItem> {
        let item = match self.get(run_id) {
            Some(existing) => SyncQueueItem {
                reason: reason.to_string(),
                attempts: existing.attempts + 1,
                human_action_required,
                last_error,
                run_dir: run_dir.to_path_buf(),
                ..existing
            },
            None => SyncQueueItem {
                run_id: run_id.to_string(),
                run_dir: run_dir.to_path_buf(),
                enqueued_at: now,
                reason: reason.to_string(),
                attempts: 1,
                human_action_required,
                last_error,
            },
        };
        artifacts::write_json_atomic(&self.path_for(run_id), &item)?;
        tracing::info!(
            run_id,
            reason,
            attempts = item.attempts,
            human_action = human_action_required,
            "Sync queued"
        );
        Ok(item)
    }

    /// Returns whether an entry existed.
    pub fn remove(&self, run_id: &str) -> std::io::Result<bool> {
        match std::fs::remove_file(self.path_for(run_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every readable item, oldest first.
    pub fn items(&self) -> Vec<SyncQueueItem> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut items: Vec<SyncQueueItem> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| artifacts::read_json_opt(&p))
            .collect();
        items.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        items
    }

    pub fn backlog(&self) -> usize {
        self.items().len()
    }

    pub fn human_action_items(&self) -> Vec<SyncQueueItem> {
        self.items()
            .into_iter()
            .filter(|i| i.human_action_required)
            .collect()
    }
}

/// Re-run sync for queued runs.
///
/// `only_human_action = true` retries the flagged items (after someone fixed
/// the cause); `false` retries the items that need no human.
pub fn retry_queue(
    ctx: &OpsContext,
    only_human_action: bool,
) -> Vec<(String, Result<SyncOutcome, SyncError>)> {
    let queue = SyncQueue::new(&ctx.config.sync_queue_dir());
    let client = SyncClient::new(ctx);
    let mut results = Vec::new();

    for item in queue.items() {
        if item.human_action_required != only_human_action {
            continue;
        }
        if !item.run_dir.is_dir() {
            tracing::warn!(run_id = %item.run_id, "Queued run directory gone, dropping entry");
            if let Err(e) = queue.remove(&item.run_id) {
                tracing::warn!(run_id = %item.run_id, error = %e, "Failed to drop queue entry");
            }
            continue;
        }
        let result = client.sync_run(&item.run_dir);
        if let Err(e) = &result {
            tracing::warn!(run_id = %item.run_id, error = %e, "Queued sync failed");
        }
        results.push((item.run_id, result));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn upsert_keeps_enqueue_time_and_counts_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SyncQueue::new(dir.path());
        let run_dir = dir.path().join("r1");
        queue
            .upsert("r1", &run_dir, "lock_contended", None, false, at("2024-01-01T00:00:00Z"))
            .unwrap();
        let item = queue
            .upsert(
                "r1",
                &run_dir,
                "failed",
                Some("HTTP 401".into()),
                true,
                at("2024-01-02T00:00:00Z"),
            )
            .unwrap();
        assert_eq!(item.attempts, 2);
        assert_eq!(item.enqueued_at, at("2024-01-01T00:00:00Z"));
        assert!(item.human_action_required);
        assert_eq!(queue.backlog(), 1);
        assert_eq!(queue.human_action_items().len(), 1);
    }

    #[test]
    fn items_sorted_and_removable() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SyncQueue::new(dir.path());
        queue.upsert("b", dir.path(), "x", None, false, at("2024-01-02T00:00:00Z")).unwrap();
        queue.upsert("a", dir.path(), "x", None, false, at("2024-01-03T00:00:00Z")).unwrap();
        queue.upsert("c", dir.path(), "x", None, false, at("2024-01-01T00:00:00Z")).unwrap();
        std::fs::write(dir.path().join("junk.json"), "{").unwrap();

        let ids: Vec<String> = queue.items().into_iter().map(|i| i.run_id).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        assert!(queue.remove("b").unwrap());
        assert!(!queue.remove("b").unwrap());
        assert_eq!(queue.backlog(), 2);
    }

    #[test]
    fn missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(SyncQueue::new(&dir.path().join("none")).backlog(), 0);
    }
}
