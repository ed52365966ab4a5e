//! Retention sweep over the runs directory.
//!
//! Old runs move to `<runs_dir>/_trash/<run_id>`; trash older than
//! `trash_days` is deleted, oldest first, a bounded number per sweep. Failed
//! runs get a lesson recorded before they leave the runs directory.

pub mod lessons;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::artifacts::{self, RunMetadata, RunStatus, RUN_METADATA};
use crate::context::OpsContext;
use crate::file_lock::{FileLock, LockError, LockOptions};

/// Marker file that exempts a run from retention.
pub const PIN_MARKER: &str = ".pin";
/// Written into a trashed run with the time it was trashed.
pub const TRASHED_AT_MARKER: &str = ".trashed_at";

#[derive(Error, Debug)]
pub enum RetentionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrashCandidate {
    pub run_id: String,
    pub status: RunStatus,
    pub age_days: i64,
}

/// What a sweep would do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionPlan {
    pub to_trash: Vec<TrashCandidate>,
    /// Trash entries to delete, oldest first.
    pub to_delete: Vec<String>,
    pub pinned: Vec<String>,
    pub kept: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub dry_run: bool,
    pub plan: RetentionPlan,
    pub trashed: Vec<String>,
    pub deleted: Vec<String>,
    pub lessons_recorded: Vec<String>,
    pub errors: Vec<String>,
}

pub(crate) fn is_hidden(name: &str) -> bool {
    name.starts_with('_') || name.starts_with('.')
}

fn dir_mtime(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Status and finish time of a run. A run without metadata counts as failed.
pub(crate) fn run_status(run_dir: &Path) -> (RunStatus, Option<DateTime<Utc>>) {
    match artifacts::read_json_opt::<RunMetadata>(&run_dir.join(RUN_METADATA)) {
        Some(meta) => (meta.status, Some(meta.finished_at)),
        None => (RunStatus::Failed, dir_mtime(run_dir)),
    }
}

fn trashed_at(entry: &Path) -> Option<DateTime<Utc>> {
    std::fs::read_to_string(entry.join(TRASHED_AT_MARKER))
        .ok()
        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|t| t.with_timezone(&Utc))
        .or_else(|| dir_mtime(entry))
}

pub(crate) fn sorted_subdirs(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut out: Vec<(String, PathBuf)> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e),
    };
    out.sort();
    Ok(out)
}

/// Partition the runs directory without touching it.
pub fn plan(
    ctx: &OpsContext,
    current_run: Option<&str>,
    now: DateTime<Utc>,
) -> Result<RetentionPlan, RetentionError> {
    let config = &ctx.config.retention;
    let mut plan = RetentionPlan::default();

    for (name, path) in sorted_subdirs(&ctx.config.runs_dir)? {
        if is_hidden(&name) || Some(name.as_str()) == current_run {
            continue;
        }
        if path.join(PIN_MARKER).exists() {
            plan.pinned.push(name);
            continue;
        }
        let (status, finished) = run_status(&path);
        let age_days = finished.map(|t| (now - t).num_days()).unwrap_or(0);
        let limit = match status {
            RunStatus::Failed => config.failed_days,
            RunStatus::Success => config.success_days,
        };
        if age_days >= limit {
            plan.to_trash.push(TrashCandidate {
                run_id: name,
                status,
                age_days,
            });
        } else {
            plan.kept.push(name);
        }
    }

    let mut expired: Vec<(DateTime<Utc>, String)> = sorted_subdirs(&ctx.config.trash_dir())?
        .into_iter()
        .filter_map(|(name, path)| {
            let at = trashed_at(&path)?;
            ((now - at).num_days() >= config.trash_days).then_some((at, name))
        })
        .collect();
    expired.sort();
    plan.to_delete = expired
        .into_iter()
        .take(config.max_delete_per_run)
        .map(|(_, name)| name)
        .collect();

    Ok(plan)
}

fn trash_destination(trash_dir: &Path, run_id: &str, now: DateTime<Utc>) -> PathBuf {
    let dest = trash_dir.join(run_id);
    if !dest.exists() {
        return dest;
    }
    trash_dir.join(format!("{run_id}.{}", now.format("%Y%m%dT%H%M%S")))
}

/// Run a retention sweep under `<state_dir>/retention.lock`.
/// With `retention.dry_run` the plan is returned and nothing changes.
pub fn sweep(ctx: &OpsContext, current_run: Option<&str>) -> Result<RetentionReport, RetentionError> {
    let now = ctx.now();
    let dry_run = ctx.config.retention.dry_run;

    if dry_run {
        let plan = plan(ctx, current_run, now)?;
        tracing::info!(
            trash = plan.to_trash.len(),
            delete = plan.to_delete.len(),
            "Retention dry run"
        );
        return Ok(RetentionReport {
            dry_run,
            plan,
            ..Default::default()
        });
    }

    let state_dir = ctx.config.state_dir();
    let _lock = FileLock::acquire(
        &state_dir.join("retention.lock"),
        "retention",
        LockOptions {
            ttl: Duration::from_secs(600),
            wait_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        },
        ctx.clock.as_ref(),
    )?;

    let plan = plan(ctx, current_run, now)?;
    let mut report = RetentionReport {
        dry_run,
        plan: plan.clone(),
        ..Default::default()
    };
    let runs_dir = &ctx.config.runs_dir;
    let trash_dir = ctx.config.trash_dir();
    let lessons_path = ctx.config.lessons_path();

    for candidate in &plan.to_trash {
        let run_dir = runs_dir.join(&candidate.run_id);
        if candidate.status == RunStatus::Failed {
            match lessons::ensure_lesson_for_run(&lessons_path, &run_dir, &candidate.run_id, ctx.clock.as_ref()) {
                Ok(true) => report.lessons_recorded.push(candidate.run_id.clone()),
                Ok(false) => {}
                Err(e) => {
                    report.errors.push(format!("{}: lesson: {e}", candidate.run_id));
                    continue;
                }
            }
        }
        let moved = std::fs::create_dir_all(&trash_dir)
            .and_then(|_| {
                let dest = trash_destination(&trash_dir, &candidate.run_id, now);
                std::fs::rename(&run_dir, &dest).map(|_| dest)
            })
            .and_then(|dest| std::fs::write(dest.join(TRASHED_AT_MARKER), now.to_rfc3339()));
        match moved {
            Ok(()) => {
                tracing::info!(run_id = %candidate.run_id, age_days = candidate.age_days, "Run moved to trash");
                report.trashed.push(candidate.run_id.clone());
            }
            Err(e) => report.errors.push(format!("{}: trash: {e}", candidate.run_id)),
        }
    }

    for name in &plan.to_delete {
        match std::fs::remove_dir_all(trash_dir.join(name)) {
            Ok(()) => {
                tracing::info!(entry = %name, "Trash entry deleted");
                report.deleted.push(name.clone());
            }
            Err(e) => report.errors.push(format!("{name}: delete: {e}")),
        }
    }

    if !report.errors.is_empty() {
        tracing::warn!(errors = report.errors.len(), "Retention sweep finished with errors");
    }
    Ok(report)
}

/// Exempt a run directory from retention.
pub fn pin_run(run_dir: &Path) -> std::io::Result<()> {
    std::fs::write(run_dir.join(PIN_MARKER), b"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpsConfig;
    use crate::context::FixedClock;
    use crate::preflight::PreflightReport;
    use std::sync::Arc;

    const NOW: &str = "2024-06-30T00:00:00Z";

    fn ctx(runs_dir: &Path) -> OpsContext {
        let mut config = OpsConfig::default();
        config.runs_dir = runs_dir.to_path_buf();
        OpsContext::new(config)
            .unwrap()
            .with_clock(Arc::new(FixedClock::at(NOW)))
    }

    fn make_run(runs_dir: &Path, id: &str, status: RunStatus, days_old: i64) -> PathBuf {
        let dir = runs_dir.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        let finished = FixedClock::at(NOW).0 - chrono::Duration::days(days_old);
        let meta = RunMetadata {
            schema_version: "1.0".into(),
            run_id: id.into(),
            project: "p".into(),
            status,
            created_at: finished,
            finished_at: finished,
            tool_version: "test".into(),
            config: serde_json::json!({}),
            preflight: PreflightReport::default(),
        };
        artifacts::write_json_atomic(&dir.join(RUN_METADATA), &meta).unwrap();
        dir
    }

    #[test]
    fn plan_partitions_by_status_and_age() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        make_run(tmp.path(), "old-failed", RunStatus::Failed, 20);
        make_run(tmp.path(), "new-failed", RunStatus::Failed, 2);
        make_run(tmp.path(), "old-success", RunStatus::Success, 40);
        make_run(tmp.path(), "mid-success", RunStatus::Success, 20);
        let pinned = make_run(tmp.path(), "pinned", RunStatus::Failed, 100);
        pin_run(&pinned).unwrap();
        make_run(tmp.path(), "current", RunStatus::Failed, 100);

        let plan = plan(&ctx, Some("current"), ctx.now()).unwrap();
        let trash: Vec<&str> = plan.to_trash.iter().map(|c| c.run_id.as_str()).collect();
        assert_eq!(trash, vec!["old-failed", "old-success"]);
        assert_eq!(plan.pinned, vec!["pinned"]);
        assert_eq!(plan.kept, vec!["mid-success", "new-failed"]);
    }

    #[test]
    fn dry_run_changes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = ctx(tmp.path());
        ctx.config.retention.dry_run = true;
        make_run(tmp.path(), "old-failed", RunStatus::Failed, 20);

        let report = sweep(&ctx, None).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.plan.to_trash.len(), 1);
        assert!(report.trashed.is_empty());
        assert!(tmp.path().join("old-failed").exists());
        assert!(!ctx.config.lessons_path().exists());
    }

    #[test]
    fn sweep_trashes_and_records_lessons() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        make_run(tmp.path(), "old-failed", RunStatus::Failed, 20);
        make_run(tmp.path(), "old-success", RunStatus::Success, 40);

        let report = sweep(&ctx, None).unwrap();
        assert_eq!(report.trashed, vec!["old-failed", "old-success"]);
        assert_eq!(report.lessons_recorded, vec!["old-failed"]);
        assert!(ctx.config.trash_dir().join("old-failed").join(TRASHED_AT_MARKER).exists());
        assert!(!tmp.path().join("old-failed").exists());
        assert!(lessons::has_lesson_for(&ctx.config.lessons_path(), "old-failed"));
        assert!(!ctx.config.state_dir().join("retention.lock").exists());
    }

    #[test]
    fn expired_trash_deleted_oldest_first_with_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = ctx(tmp.path());
        ctx.config.retention.max_delete_per_run = 2;
        let trash = ctx.config.trash_dir();
        for (name, days) in [("a", 10), ("b", 30), ("c", 20), ("d", 1)] {
            let dir = trash.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            let at = ctx.now() - chrono::Duration::days(days);
            std::fs::write(dir.join(TRASHED_AT_MARKER), at.to_rfc3339()).unwrap();
        }

        let report = sweep(&ctx, None).unwrap();
        assert_eq!(report.deleted, vec!["b", "c"]);
        assert!(trash.join("a").exists());
        assert!(trash.join("d").exists());
    }

    #[test]
    fn empty_runs_dir_is_fine() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(&tmp.path().join("missing"));
        let report = sweep(&ctx, None).unwrap();
        assert!(report.trashed.is_empty());
    }
}
