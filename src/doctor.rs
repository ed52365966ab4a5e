//! Doctor — read-only operational report.
//!
//! Aggregates persisted state into one Markdown document: network profile,
//! sync queue backlog, runs waiting on a human, active block rules and a
//! weekly scoreboard over recent runs. Nothing here writes to disk.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::{self, codes, Metrics, WarningsFile, MANIFEST, METRICS, WARNINGS};
use crate::context::OpsContext;
use crate::preflight::network::NetworkProfile;
use crate::retention::{self, lessons};
use crate::sync::{SyncQueue, SyncQueueItem, SyncState};

/// Runs finished within this window count toward the scoreboard.
pub const SCOREBOARD_WINDOW_DAYS: i64 = 7;

/// Only the flag the scoreboard needs; older manifests may lack other fields.
#[derive(Debug, Default, Deserialize)]
struct ManifestFlags {
    #[serde(default)]
    committed_drive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Scoreboard {
    pub runs: usize,
    pub committed: usize,
    pub contract_failures: usize,
    pub needs_ocr: usize,
    pub ocr_failed: usize,
    /// Mean over runs that recorded metrics.
    pub mean_empty_page_ratio: Option<f64>,
    pub sync_retries: u64,
    pub sync_resumes: u64,
}

fn ratio(numerator: usize, denominator: usize) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

impl Scoreboard {
    pub fn committed_rate(&self) -> Option<f64> {
        ratio(self.committed, self.runs)
    }

    pub fn contract_failure_rate(&self) -> Option<f64> {
        ratio(self.contract_failures, self.runs)
    }

    /// OCR failures over documents that needed OCR.
    pub fn ocr_failure_rate(&self) -> Option<f64> {
        ratio(self.ocr_failed, self.needs_ocr)
    }
}

/// Scoreboard over runs under `runs_dir` finished within the last week.
pub fn scoreboard(runs_dir: &Path, now: DateTime<Utc>) -> Scoreboard {
    let mut board = Scoreboard::default();
    let window = Duration::days(SCOREBOARD_WINDOW_DAYS);
    let runs = match retention::sorted_subdirs(runs_dir) {
        Ok(runs) => runs,
        Err(e) => {
            tracing::warn!(dir = %runs_dir.display(), error = %e, "Runs directory unreadable");
            return board;
        }
    };

    let mut empty_ratios = Vec::new();
    for (name, path) in runs {
        if retention::is_hidden(&name) {
            continue;
        }
        let (_, finished) = retention::run_status(&path);
        let Some(finished) = finished else { continue };
        if now - finished > window || finished > now {
            continue;
        }
        board.runs += 1;

        if artifacts::read_json_opt::<ManifestFlags>(&path.join(MANIFEST))
            .is_some_and(|m| m.committed_drive)
        {
            board.committed += 1;
        }
        let warnings = artifacts::read_json_opt::<WarningsFile>(&path.join(WARNINGS));
        let has_warning = |code: &str| warnings.as_ref().is_some_and(|w| w.has_code(code));
        if has_warning(codes::CONTRACT_VALIDATION_FAILED) {
            board.contract_failures += 1;
        }
        if let Some(metrics) = artifacts::read_json_opt::<Metrics>(&path.join(METRICS)) {
            board.needs_ocr += metrics.needs_ocr;
            board.ocr_failed += metrics.ocr_failed;
            // Documents that needed OCR while the tool was missing.
            if has_warning(codes::OCR_UNAVAILABLE) {
                board.ocr_failed += metrics.needs_ocr.saturating_sub(metrics.ocr_attempted);
            }
            empty_ratios.push(metrics.mean_empty_page_ratio);
        }
        if let Some(state) = SyncState::load(&path) {
            board.sync_retries += u64::from(state.retries);
            board.sync_resumes += u64::from(state.resume_count);
        }
    }

    if !empty_ratios.is_empty() {
        board.mean_empty_page_ratio =
            Some(empty_ratios.iter().sum::<f64>() / empty_ratios.len() as f64);
    }
    board
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub generated_at: DateTime<Utc>,
    pub network_profile: NetworkProfile,
    pub backlog: usize,
    pub human_action: Vec<SyncQueueItem>,
    pub block_rules: Vec<String>,
    pub scoreboard: Scoreboard,
}

/// Collect the report. Probes the network; never writes.
pub fn run_doctor(ctx: &OpsContext) -> DoctorReport {
    let now = ctx.now();
    let queue = SyncQueue::new(&ctx.config.sync_queue_dir());
    let items = queue.items();
    let report = DoctorReport {
        generated_at: now,
        network_profile: ctx.network.profile(),
        backlog: items.len(),
        human_action: items
            .into_iter()
            .filter(|i| i.human_action_required)
            .collect(),
        block_rules: lessons::load_block_rules(&ctx.config.lessons_path()),
        scoreboard: scoreboard(&ctx.config.runs_dir, now),
    };
    tracing::info!(
        network = %report.network_profile,
        backlog = report.backlog,
        human_action = report.human_action.len(),
        block_rules = report.block_rules.len(),
        runs = report.scoreboard.runs,
        "Doctor report collected"
    );
    report
}

fn percent(rate: Option<f64>) -> String {
    rate.map(|r| format!("{:.1}%", r * 100.0))
        .unwrap_or_else(|| "n/a".to_string())
}

impl DoctorReport {
    /// Suggested follow-ups, most urgent first.
    pub fn next_commands(&self) -> Vec<String> {
        let mut commands = Vec::new();
        let offline = self.network_profile == NetworkProfile::Offline;

        for item in &self.human_action {
            let duplicate = item
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("duplicate_remote_folder"));
            if duplicate {
                commands.push(format!(
                    "ingestops repair {}  # merge duplicate remote folders",
                    item.run_id
                ));
            }
        }
        if !self.human_action.is_empty() {
            commands.push(
                "ingestops retry-queue --human-action  # after fixing credentials or sharing"
                    .to_string(),
            );
        }
        if self.backlog > self.human_action.len() {
            if offline {
                commands.push(
                    "restore connectivity, then: ingestops retry-queue".to_string(),
                );
            } else {
                commands.push("ingestops retry-queue".to_string());
            }
        }
        for rule in &self.block_rules {
            commands.push(format!(
                "ingestops remove-rule '{rule}'  # once the cause is fixed"
            ));
        }
        if self.scoreboard.contract_failures > 0 {
            commands.push("ingestops validate <run_dir>  # inspect contract violations".to_string());
        }
        commands.push("ingestops retention --dry-run".to_string());
        commands
    }

    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        md.push_str("# ingestops doctor\n\n");
        md.push_str(&format!("Generated: {}\n\n", self.generated_at.to_rfc3339()));

        md.push_str("## Network\n\n");
        md.push_str(&format!("- Profile: {}\n\n", self.network_profile));

        md.push_str("## Sync queue\n\n");
        md.push_str(&format!("- Backlog: {}\n", self.backlog));
        md.push_str(&format!(
            "- Human action required: {}\n",
            self.human_action.len()
        ));
        for item in &self.human_action {
            md.push_str(&format!(
                "  - `{}` ({}, {} attempt(s)): {}\n",
                item.run_id,
                item.reason,
                item.attempts,
                item.last_error.as_deref().unwrap_or("no error recorded")
            ));
        }
        md.push('\n');

        md.push_str("## Block rules\n\n");
        if self.block_rules.is_empty() {
            md.push_str("_none_\n");
        }
        for rule in &self.block_rules {
            md.push_str(&format!("- `{rule}`\n"));
        }
        md.push('\n');

        let board = &self.scoreboard;
        md.push_str(&format!(
            "## Weekly scoreboard (last {SCOREBOARD_WINDOW_DAYS} days)\n\n"
        ));
        md.push_str("| Metric | Value |\n|---|---|\n");
        md.push_str(&format!("| Runs | {} |\n", board.runs));
        md.push_str(&format!(
            "| Committed rate | {} ({}/{}) |\n",
            percent(board.committed_rate()),
            board.committed,
            board.runs
        ));
        md.push_str(&format!(
            "| Contract failure rate | {} ({}/{}) |\n",
            percent(board.contract_failure_rate()),
            board.contract_failures,
            board.runs
        ));
        md.push_str(&format!(
            "| OCR failure rate | {} ({}/{}) |\n",
            percent(board.ocr_failure_rate()),
            board.ocr_failed,
            board.needs_ocr
        ));
        md.push_str(&format!(
            "| Mean empty-page ratio | {} |\n",
            board
                .mean_empty_page_ratio
                .map(|r| format!("{r:.3}"))
                .unwrap_or_else(|| "n/a".to_string())
        ));
        md.push_str(&format!("| Sync retries | {} |\n", board.sync_retries));
        md.push_str(&format!("| Sync resumes | {} |\n\n", board.sync_resumes));

        md.push_str("## Next commands\n\n");
        for command in self.next_commands() {
            md.push_str(&format!("- `{command}`\n"));
        }
        md
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{RunMetadata, RunStatus, Warning, RUN_METADATA, SCHEMA_VERSION};
    use crate::config::OpsConfig;
    use crate::context::FixedClock;
    use crate::preflight::network::MockNetworkProbe;
    use crate::preflight::PreflightReport;
    use std::path::PathBuf;
    use std::sync::Arc;

    const NOW: &str = "2024-06-10T12:00:00Z";

    fn ctx(dir: &Path) -> OpsContext {
        let mut config = OpsConfig::default();
        config.runs_dir = dir.join("runs");
        OpsContext::new(config)
            .unwrap()
            .with_clock(Arc::new(FixedClock::at(NOW)))
            .with_network_probe(Arc::new(MockNetworkProbe::online()))
    }

    fn write_run(runs_dir: &Path, run_id: &str, days_ago: i64, committed: bool) -> PathBuf {
        let dir = runs_dir.join(run_id);
        std::fs::create_dir_all(&dir).unwrap();
        let finished = FixedClock::at(NOW).0 - Duration::days(days_ago);
        let meta = RunMetadata {
            schema_version: SCHEMA_VERSION.into(),
            run_id: run_id.into(),
            project: "default".into(),
            status: RunStatus::Success,
            created_at: finished,
            finished_at: finished,
            tool_version: "test".into(),
            config: serde_json::json!({}),
            preflight: PreflightReport::default(),
        };
        artifacts::write_json_atomic(&dir.join(RUN_METADATA), &meta).unwrap();
        artifacts::write_json_atomic(
            &dir.join(MANIFEST),
            &serde_json::json!({ "run_id": run_id, "committed_drive": committed }),
        )
        .unwrap();
        dir
    }

    fn snapshot(dir: &Path) -> Vec<(PathBuf, u64)> {
        let mut out = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            for entry in std::fs::read_dir(&d).unwrap().flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    out.push((path.clone(), std::fs::metadata(&path).unwrap().len()));
                }
            }
        }
        out.sort();
        out
    }

    #[test]
    fn empty_state_still_renders_every_section() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_doctor(&ctx(dir.path()));
        assert_eq!(report.backlog, 0);
        assert_eq!(report.scoreboard, Scoreboard::default());

        let md = report.to_markdown();
        for section in [
            "## Network",
            "## Sync queue",
            "## Block rules",
            "## Weekly scoreboard",
            "## Next commands",
        ] {
            assert!(md.contains(section), "missing {section}");
        }
        assert!(md.contains("- Profile: ONLINE"));
        assert!(md.contains("| Committed rate | n/a (0/0) |"));
        assert!(md.contains("ingestops retention --dry-run"));
    }

    #[test]
    fn scoreboard_counts_recent_runs_only() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs");
        let a = write_run(&runs, "run-a", 1, true);
        let b = write_run(&runs, "run-b", 3, false);
        write_run(&runs, "run-old", 30, true);
        std::fs::create_dir_all(runs.join("_trash").join("run-x")).unwrap();

        artifacts::write_json_atomic(
            &a.join(METRICS),
            &Metrics {
                needs_ocr: 4,
                ocr_failed: 1,
                mean_empty_page_ratio: 0.2,
                ..Default::default()
            },
        )
        .unwrap();
        artifacts::write_json_atomic(
            &b.join(METRICS),
            &Metrics {
                needs_ocr: 0,
                mean_empty_page_ratio: 0.4,
                ..Default::default()
            },
        )
        .unwrap();
        artifacts::write_json_atomic(
            &b.join(WARNINGS),
            &WarningsFile {
                schema_version: SCHEMA_VERSION.into(),
                run_id: "run-b".into(),
                warnings: vec![Warning::new(codes::CONTRACT_VALIDATION_FAILED, "missing:metrics.json")],
            },
        )
        .unwrap();
        let mut state = SyncState::new("run-a", FixedClock::at(NOW).0);
        state.retries = 2;
        state.resume_count = 1;
        state.save(&a, FixedClock::at(NOW).0).unwrap();

        let board = scoreboard(&runs, FixedClock::at(NOW).0);
        assert_eq!(board.runs, 2);
        assert_eq!(board.committed_rate(), Some(0.5));
        assert_eq!(board.contract_failure_rate(), Some(0.5));
        assert_eq!(board.ocr_failure_rate(), Some(0.25));
        assert!((board.mean_empty_page_ratio.unwrap() - 0.3).abs() < 1e-9);
        assert_eq!(board.sync_retries, 2);
        assert_eq!(board.sync_resumes, 1);
    }

    #[test]
    fn missing_ocr_tool_counts_as_ocr_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs");
        let run = write_run(&runs, "run-no-ocr", 1, false);
        artifacts::write_json_atomic(
            &run.join(METRICS),
            &Metrics {
                needs_ocr: 2,
                ocr_attempted: 0,
                ..Default::default()
            },
        )
        .unwrap();
        artifacts::write_json_atomic(
            &run.join(WARNINGS),
            &WarningsFile {
                schema_version: SCHEMA_VERSION.into(),
                run_id: "run-no-ocr".into(),
                warnings: vec![Warning::new(codes::OCR_UNAVAILABLE, "mock-ocr unavailable")],
            },
        )
        .unwrap();

        let board = scoreboard(&runs, FixedClock::at(NOW).0);
        assert_eq!(board.needs_ocr, 2);
        assert_eq!(board.ocr_failed, 2);
        assert_eq!(board.ocr_failure_rate(), Some(1.0));
    }

    #[test]
    fn queue_and_rules_drive_next_commands_without_writes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let now = ctx.now();
        let queue = SyncQueue::new(&ctx.config.sync_queue_dir());
        queue
            .upsert(
                "run-dup",
                &ctx.config.run_dir("run-dup"),
                "failed",
                Some("duplicate_remote_folder: 2 folders named \"run-dup\"".into()),
                true,
                now,
            )
            .unwrap();
        queue
            .upsert("run-net", &ctx.config.run_dir("run-net"), "offline", None, false, now)
            .unwrap();
        std::fs::write(
            ctx.config.lessons_path(),
            "## Lesson run-z\n- recorded_at: 2024-06-01T00:00:00+00:00\n- category: auth\n\
             - root_cause: expired\n- block_rule: hard:require_auth_token\n",
        )
        .unwrap();

        let before = snapshot(dir.path());
        let report = run_doctor(&ctx);
        assert_eq!(snapshot(dir.path()), before);

        assert_eq!(report.backlog, 2);
        assert_eq!(report.human_action.len(), 1);
        assert_eq!(report.block_rules, vec!["hard:require_auth_token"]);

        let commands = report.next_commands();
        assert!(commands[0].starts_with("ingestops repair run-dup"));
        assert!(commands.iter().any(|c| c.starts_with("ingestops retry-queue --human-action")));
        assert!(commands.iter().any(|c| c == "ingestops retry-queue"));
        assert!(commands
            .iter()
            .any(|c| c.starts_with("ingestops remove-rule 'hard:require_auth_token'")));
    }
}
