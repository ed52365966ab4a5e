//! Duplicate remote folder repair.
//!
//! Concurrent first syncs can each create the same folder. The oldest copy
//! (by `created_at`, then id) stays; the rest move into `_quarantine` under
//! the same parent so nothing is deleted.

use serde::Serialize;

use super::client::resolve_folder;
use super::transport::{RemoteEntry, RemoteStore};
use super::SyncError;
use crate::context::OpsContext;

pub const QUARANTINE_FOLDER: &str = "_quarantine";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub parent_id: String,
    pub name: String,
    pub primary_id: Option<String>,
    pub quarantine_id: Option<String>,
    pub moved: Vec<String>,
}

fn age_key(entry: &RemoteEntry) -> (bool, Option<chrono::DateTime<chrono::Utc>>, String) {
    // Entries without a timestamp sort after dated ones.
    (entry.created_at.is_none(), entry.created_at, entry.id.clone())
}

/// Keep the oldest folder named `name` under `parent_id`, quarantine the rest.
pub fn repair_duplicate_folders(
    remote: &dyn RemoteStore,
    parent_id: &str,
    name: &str,
) -> Result<RepairReport, SyncError> {
    let mut report = RepairReport {
        parent_id: parent_id.to_string(),
        name: name.to_string(),
        ..Default::default()
    };
    let mut folders: Vec<RemoteEntry> = remote
        .list_children(parent_id)?
        .into_iter()
        .filter(|e| e.is_folder && e.name == name)
        .collect();
    folders.sort_by_key(age_key);

    let mut folders = folders.into_iter();
    let Some(primary) = folders.next() else {
        return Ok(report);
    };
    report.primary_id = Some(primary.id.clone());

    let duplicates: Vec<RemoteEntry> = folders.collect();
    if duplicates.is_empty() {
        return Ok(report);
    }

    let quarantine = resolve_folder(remote, parent_id, QUARANTINE_FOLDER)?;
    for dup in duplicates {
        remote.move_entry(&dup.id, &quarantine)?;
        tracing::warn!(
            folder = %dup.id,
            name,
            primary = %primary.id,
            "Duplicate folder quarantined"
        );
        report.moved.push(dup.id);
    }
    report.quarantine_id = Some(quarantine);
    Ok(report)
}

/// Repair both levels of a run's destination: `<root>/<project>` and `<project>/<run_id>`.
pub fn repair_run_destination(
    ctx: &OpsContext,
    run_id: &str,
) -> Result<Vec<RepairReport>, SyncError> {
    let remote = ctx.remote.clone().ok_or(SyncError::NoRemote)?;
    let root = &ctx.config.sync.root_folder_id;
    let project = repair_duplicate_folders(remote.as_ref(), root, &ctx.config.project)?;
    let project_id = project.primary_id.clone();
    let mut reports = vec![project];
    if let Some(project_id) = project_id {
        reports.push(repair_duplicate_folders(remote.as_ref(), &project_id, run_id)?);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::transport::MockRemoteStore;
    use chrono::{DateTime, Utc};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn oldest_folder_wins() {
        let store = MockRemoteStore::new();
        let newer = store.add_folder("root", "proj", at("2024-02-01T00:00:00Z"));
        let oldest = store.add_folder("root", "proj", at("2024-01-01T00:00:00Z"));
        let newest = store.add_folder("root", "proj", at("2024-03-01T00:00:00Z"));

        let report = repair_duplicate_folders(&store, "root", "proj").unwrap();
        assert_eq!(report.primary_id.as_deref(), Some(oldest.as_str()));
        assert_eq!(report.moved, vec![newer, newest]);

        let quarantine = report.quarantine_id.unwrap();
        assert_eq!(store.children_of(&quarantine), vec!["proj", "proj"]);
        assert_eq!(store.folder_at(&["proj"]), Some(oldest));
        assert_eq!(store.children_of("root"), vec!["_quarantine", "proj"]);
    }

    #[test]
    fn single_folder_is_untouched() {
        let store = MockRemoteStore::new();
        let only = store.add_folder("root", "proj", at("2024-01-01T00:00:00Z"));
        let report = repair_duplicate_folders(&store, "root", "proj").unwrap();
        assert_eq!(report.primary_id, Some(only));
        assert!(report.moved.is_empty());
        assert!(report.quarantine_id.is_none());
    }

    #[test]
    fn run_destination_repairs_both_levels() {
        let store = std::sync::Arc::new(MockRemoteStore::new());
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let project = store.add_folder("root", "default", epoch);
        store.add_folder(&project, "run-1", at("2024-01-01T00:00:00Z"));
        store.add_folder(&project, "run-1", at("2024-01-02T00:00:00Z"));
        let ctx = OpsContext::new(crate::config::OpsConfig::default())
            .unwrap()
            .with_remote(store.clone());

        let reports = repair_run_destination(&ctx, "run-1").unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].moved.is_empty());
        assert_eq!(reports[1].moved.len(), 1);
        assert_eq!(store.children_of(&project), vec!["_quarantine", "run-1"]);
    }

    #[test]
    fn missing_folder_reports_nothing() {
        let store = MockRemoteStore::new();
        let report = repair_duplicate_folders(&store, "root", "proj").unwrap();
        assert!(report.primary_id.is_none());
    }
}
