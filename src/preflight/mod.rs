//! Preflight gate.
//!
//! Fixed environment checks run first, in order, followed by one dynamic check
//! per block rule learned from earlier failures (`lesson:<rule>`). Every check
//! is recorded; only hard failures land in `errors` and fail the gate.

pub mod auth;
pub mod network;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::RuleMode;
use crate::context::OpsContext;
use crate::error::{classify_error, ErrorCategory};
use crate::retention::lessons;
use crate::sync::queue::SyncQueue;

use self::network::NetworkProfile;

pub const CHECK_INPUTS_EXIST: &str = "check_inputs_exist";
pub const CHECK_DISK_SPACE: &str = "check_disk_space";
pub const CHECK_AUTH_TOKEN: &str = "check_auth_token";
pub const CHECK_NETWORK_PROFILE: &str = "check_network_profile";
pub const CHECK_SYNC_QUEUE_BACKLOG: &str = "check_sync_queue_backlog";
/// Appended by the orchestrator when OCR is needed but unavailable.
pub const CHECK_OCR_RUNTIME_AVAILABLE: &str = "check_ocr_runtime_available";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
    /// Effective hardness after rule-mode downgrade.
    pub hard: bool,
    pub configured_hard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub checks: Vec<PreflightCheck>,
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub network_profile: NetworkProfile,
}

impl Default for PreflightReport {
    fn default() -> Self {
        Self {
            checks: Vec::new(),
            passed: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            network_profile: NetworkProfile::Unknown,
        }
    }
}

impl PreflightReport {
    fn push(&mut self, check: PreflightCheck) {
        if !check.ok {
            let line = format!("{}: {}", check.name, check.detail);
            if check.hard {
                self.errors.push(line);
            } else {
                self.warnings.push(line);
            }
        }
        self.checks.push(check);
        self.passed = self.errors.is_empty();
    }

    /// Hard failure discovered after the gate ran (e.g. OCR runtime missing).
    pub fn record_runtime_failure(&mut self, name: &str, detail: &str) {
        self.push(PreflightCheck {
            name: name.to_string(),
            ok: false,
            detail: detail.to_string(),
            hard: true,
            configured_hard: true,
        });
    }

    pub fn check(&self, name: &str) -> Option<&PreflightCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Category of the first failed hard check, for failure analysis.
    pub fn failure_category(&self) -> Option<ErrorCategory> {
        let failed = self.checks.iter().find(|c| !c.ok && c.hard)?;
        let name = failed.name.as_str();
        let category = if name.contains("auth") {
            ErrorCategory::Auth
        } else if name.contains("network") {
            ErrorCategory::Network
        } else if name.contains("backlog") {
            ErrorCategory::Quota
        } else if name.contains("ocr") {
            ErrorCategory::Ocr
        } else if name.contains("readable") {
            ErrorCategory::Parser
        } else if name.contains("disk") || name.contains("inputs") {
            ErrorCategory::Io
        } else {
            classify_error(&failed.detail)
        };
        Some(category)
    }
}

// ═══════════════════════════════════════════════════════════
// Block rules
// ═══════════════════════════════════════════════════════════

/// Explicit hardness prefix on a lesson rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePrefix {
    Hard,
    Warn,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRuleKind {
    RequireNetworkOnline,
    RequireAuthToken,
    RequireOcrAvailable,
    RequireInputsReadable,
    MinFreeDiskMb(u64),
    MaxSyncQueueBacklog(usize),
    RequireSyncDisabled,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRule {
    pub raw: String,
    pub prefix: RulePrefix,
    pub kind: BlockRuleKind,
}

impl BlockRule {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let (prefix, body) = if let Some(rest) = raw.strip_prefix("hard:") {
            (RulePrefix::Hard, rest)
        } else if let Some(rest) = raw.strip_prefix("warn:") {
            (RulePrefix::Warn, rest)
        } else {
            (RulePrefix::None, raw)
        };
        let body = body.trim();

        let kind = match body.split_once('=') {
            Some(("min_free_disk_mb", n)) => n
                .trim()
                .parse()
                .map(BlockRuleKind::MinFreeDiskMb)
                .unwrap_or(BlockRuleKind::Unknown),
            Some(("max_sync_queue_backlog", n)) => n
                .trim()
                .parse()
                .map(BlockRuleKind::MaxSyncQueueBacklog)
                .unwrap_or(BlockRuleKind::Unknown),
            Some(_) => BlockRuleKind::Unknown,
            None => match body {
                "require_network_online" => BlockRuleKind::RequireNetworkOnline,
                "require_auth_token" => BlockRuleKind::RequireAuthToken,
                "require_ocr_available" => BlockRuleKind::RequireOcrAvailable,
                "require_inputs_readable" => BlockRuleKind::RequireInputsReadable,
                "require_sync_disabled" => BlockRuleKind::RequireSyncDisabled,
                _ => BlockRuleKind::Unknown,
            },
        };

        Self {
            raw: raw.to_string(),
            prefix,
            kind,
        }
    }

    /// Hardness before any rule-mode downgrade.
    pub fn configured_hard(&self, mode: RuleMode) -> bool {
        match self.prefix {
            RulePrefix::Hard => true,
            RulePrefix::Warn => false,
            RulePrefix::None => mode == RuleMode::Strict,
        }
    }
}

/// Effective hardness for lesson rules and the backlog check.
fn downgraded(configured_hard: bool, ctx: &OpsContext) -> bool {
    let pf = &ctx.config.preflight;
    configured_hard && !(pf.rule_mode == RuleMode::Warn && pf.allow_hard_rule_downgrade)
}

// ═══════════════════════════════════════════════════════════
// Checks
// ═══════════════════════════════════════════════════════════

fn sync_active(ctx: &OpsContext) -> bool {
    ctx.config.sync.enabled && !ctx.config.sync.dry_run
}

/// Closest existing ancestor, so free space can be measured before the runs dir exists.
fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = path;
    loop {
        if current.exists() {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => current = parent,
            _ => return PathBuf::from("."),
        }
    }
}

fn fixed(name: &str, ok: bool, detail: String, hard: bool) -> PreflightCheck {
    PreflightCheck {
        name: name.to_string(),
        ok,
        detail,
        hard,
        configured_hard: hard,
    }
}

fn check_inputs_exist(inputs: &[PathBuf]) -> PreflightCheck {
    let missing: Vec<String> = inputs
        .iter()
        .filter(|p| !p.is_file())
        .map(|p| p.display().to_string())
        .collect();
    if inputs.is_empty() {
        fixed(CHECK_INPUTS_EXIST, false, "no input documents".into(), true)
    } else if missing.is_empty() {
        fixed(CHECK_INPUTS_EXIST, true, format!("{} input(s)", inputs.len()), true)
    } else {
        fixed(
            CHECK_INPUTS_EXIST,
            false,
            format!("missing or not a file: {}", missing.join(", ")),
            true,
        )
    }
}

fn free_disk_mb(ctx: &OpsContext) -> Option<u64> {
    fs2::available_space(nearest_existing(&ctx.config.runs_dir))
        .ok()
        .map(|b| b / (1024 * 1024))
}

fn check_disk_space(ctx: &OpsContext) -> PreflightCheck {
    let required = ctx.config.preflight.min_free_disk_mb;
    match free_disk_mb(ctx) {
        Some(free) if free >= required => fixed(
            CHECK_DISK_SPACE,
            true,
            format!("{free} MB free (min {required} MB)"),
            true,
        ),
        Some(free) => fixed(
            CHECK_DISK_SPACE,
            false,
            format!("{free} MB free, below minimum {required} MB"),
            true,
        ),
        None => fixed(
            CHECK_DISK_SPACE,
            false,
            "free space could not be determined".into(),
            true,
        ),
    }
}

fn check_auth_token(ctx: &OpsContext) -> PreflightCheck {
    if !sync_active(ctx) {
        return fixed(CHECK_AUTH_TOKEN, true, "skipped: sync inactive".into(), true);
    }
    match ctx.tokens.access_token() {
        Ok(_) => fixed(CHECK_AUTH_TOKEN, true, "token available".into(), true),
        Err(e) => fixed(CHECK_AUTH_TOKEN, false, e.to_string(), true),
    }
}

fn check_network_profile(ctx: &OpsContext, profile: NetworkProfile) -> PreflightCheck {
    let fail_policy = ctx.config.preflight.offline_policy == crate::config::OfflinePolicy::Fail;
    if profile == NetworkProfile::Unknown {
        return fixed(CHECK_NETWORK_PROFILE, true, "not probed".into(), fail_policy);
    }
    if sync_active(ctx) && profile == NetworkProfile::Offline {
        let detail = if fail_policy {
            "offline and offline_policy=fail".to_string()
        } else {
            "offline; sync will be deferred".to_string()
        };
        return fixed(CHECK_NETWORK_PROFILE, false, detail, fail_policy);
    }
    fixed(CHECK_NETWORK_PROFILE, true, profile.to_string(), fail_policy)
}

fn check_backlog(ctx: &OpsContext, backlog: usize) -> PreflightCheck {
    let bound = ctx.config.preflight.max_sync_queue_backlog;
    let configured_hard = ctx.config.preflight.rule_mode == RuleMode::Strict;
    PreflightCheck {
        name: CHECK_SYNC_QUEUE_BACKLOG.to_string(),
        ok: backlog <= bound,
        detail: if backlog <= bound {
            format!("backlog {backlog} within {bound}")
        } else {
            format!("backlog {backlog} exceeds {bound}")
        },
        hard: downgraded(configured_hard, ctx),
        configured_hard,
    }
}

fn evaluate_rule(
    ctx: &OpsContext,
    rule: &BlockRule,
    inputs: &[PathBuf],
    profile: NetworkProfile,
    backlog: usize,
) -> PreflightCheck {
    let configured_hard = rule.configured_hard(ctx.config.preflight.rule_mode);
    let (ok, detail) = match &rule.kind {
        BlockRuleKind::RequireNetworkOnline => (
            matches!(profile, NetworkProfile::Online | NetworkProfile::Vpn),
            format!("network {profile}"),
        ),
        BlockRuleKind::RequireAuthToken if !ctx.config.sync.enabled => {
            (true, "sync disabled".to_string())
        }
        BlockRuleKind::RequireAuthToken => match ctx.tokens.access_token() {
            Ok(_) => (true, "token available".to_string()),
            Err(e) => (false, e.to_string()),
        },
        BlockRuleKind::RequireOcrAvailable => {
            if ctx.ocr.available() {
                (true, format!("{} available", ctx.ocr.name()))
            } else {
                (false, format!("{} unavailable", ctx.ocr.name()))
            }
        }
        BlockRuleKind::RequireInputsReadable => {
            let unreadable: Vec<String> = inputs
                .iter()
                .filter(|p| std::fs::File::open(p).is_err())
                .map(|p| p.display().to_string())
                .collect();
            if unreadable.is_empty() {
                (true, "all inputs readable".to_string())
            } else {
                (false, format!("unreadable: {}", unreadable.join(", ")))
            }
        }
        BlockRuleKind::MinFreeDiskMb(required) => match free_disk_mb(ctx) {
            Some(free) => (free >= *required, format!("{free} MB free (min {required} MB)")),
            None => (false, "free space could not be determined".to_string()),
        },
        BlockRuleKind::MaxSyncQueueBacklog(bound) => {
            (backlog <= *bound, format!("backlog {backlog} (max {bound})"))
        }
        BlockRuleKind::RequireSyncDisabled => (
            !ctx.config.sync.enabled,
            if ctx.config.sync.enabled {
                "sync is enabled".to_string()
            } else {
                "sync disabled".to_string()
            },
        ),
        BlockRuleKind::Unknown => {
            return PreflightCheck {
                name: format!("lesson:{}", rule.raw),
                ok: false,
                detail: "unknown block rule".into(),
                hard: false,
                configured_hard,
            };
        }
    };

    PreflightCheck {
        name: format!("lesson:{}", rule.raw),
        ok,
        detail,
        hard: downgraded(configured_hard, ctx),
        configured_hard,
    }
}

/// Run every check with explicit block rules and backlog.
pub fn evaluate(
    ctx: &OpsContext,
    inputs: &[PathBuf],
    block_rules: &[String],
    backlog: usize,
) -> PreflightReport {
    let rules: Vec<BlockRule> = block_rules.iter().map(|r| BlockRule::parse(r)).collect();
    let needs_network = ctx.config.sync.enabled
        || rules
            .iter()
            .any(|r| r.kind == BlockRuleKind::RequireNetworkOnline);
    let profile = if needs_network {
        ctx.network.profile()
    } else {
        NetworkProfile::Unknown
    };

    let mut report = PreflightReport {
        network_profile: profile,
        ..Default::default()
    };
    report.push(check_inputs_exist(inputs));
    report.push(check_disk_space(ctx));
    report.push(check_auth_token(ctx));
    report.push(check_network_profile(ctx, profile));
    report.push(check_backlog(ctx, backlog));
    for rule in &rules {
        report.push(evaluate_rule(ctx, rule, inputs, profile, backlog));
    }

    if report.passed {
        tracing::info!(
            checks = report.checks.len(),
            warnings = report.warnings.len(),
            network = %profile,
            "Preflight passed"
        );
    } else {
        tracing::warn!(errors = ?report.errors, "Preflight failed");
    }
    report
}

/// Run preflight with block rules from the lessons file and the current queue backlog.
pub fn run_preflight(ctx: &OpsContext, inputs: &[PathBuf]) -> PreflightReport {
    let rules = lessons::load_block_rules(&ctx.config.lessons_path());
    let backlog = SyncQueue::new(&ctx.config.sync_queue_dir()).backlog();
    evaluate(ctx, inputs, &rules, backlog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OfflinePolicy, OpsConfig};
    use crate::pipeline::extract::MockOcrTool;
    use crate::preflight::auth::StaticTokenSource;
    use crate::preflight::network::MockNetworkProbe;
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, OpsContext, Vec<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OpsConfig::default();
        config.runs_dir = dir.path().join("runs");
        config.preflight.min_free_disk_mb = 0;
        let ctx = OpsContext::new(config)
            .unwrap()
            .with_network_probe(Arc::new(MockNetworkProbe::online()))
            .with_token_source(Arc::new(StaticTokenSource::none()))
            .with_ocr_tool(Arc::new(MockOcrTool::new("ocr")));
        let input = dir.path().join("a.pdf");
        std::fs::write(&input, b"%PDF-1.4").unwrap();
        (dir, ctx, vec![input])
    }

    #[test]
    fn fixed_checks_run_in_order() {
        let (_dir, ctx, inputs) = setup();
        let report = evaluate(&ctx, &inputs, &[], 0);
        let names: Vec<&str> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                CHECK_INPUTS_EXIST,
                CHECK_DISK_SPACE,
                CHECK_AUTH_TOKEN,
                CHECK_NETWORK_PROFILE,
                CHECK_SYNC_QUEUE_BACKLOG
            ]
        );
        assert!(report.passed);
        assert_eq!(report.network_profile, NetworkProfile::Unknown);
    }

    #[test]
    fn missing_input_fails_hard() {
        let (dir, ctx, _) = setup();
        let report = evaluate(&ctx, &[dir.path().join("nope.pdf")], &[], 0);
        assert!(!report.passed);
        assert!(report.errors[0].starts_with("check_inputs_exist: "));
    }

    #[test]
    fn backlog_over_bound_is_fatal_in_strict_mode() {
        let (_dir, mut ctx, inputs) = setup();
        ctx.config.preflight.max_sync_queue_backlog = 2;
        let report = evaluate(&ctx, &inputs, &[], 3);
        assert!(!report.passed);
        assert!(report.errors.iter().any(|e| e.contains("check_sync_queue_backlog")));
        assert_eq!(report.failure_category(), Some(ErrorCategory::Quota));
    }

    #[test]
    fn backlog_over_bound_warns_in_warn_mode() {
        let (_dir, mut ctx, inputs) = setup();
        ctx.config.preflight.max_sync_queue_backlog = 2;
        ctx.config.preflight.rule_mode = RuleMode::Warn;
        let report = evaluate(&ctx, &inputs, &[], 3);
        assert!(report.passed);
        assert!(report.warnings.iter().any(|w| w.contains("check_sync_queue_backlog")));
    }

    #[test]
    fn auth_required_only_when_sync_active() {
        let (_dir, mut ctx, inputs) = setup();
        assert!(evaluate(&ctx, &inputs, &[], 0).passed);

        ctx.config.sync.enabled = true;
        let report = evaluate(&ctx, &inputs, &[], 0);
        assert!(!report.passed);
        assert!(report.errors[0].starts_with("check_auth_token"));
        assert_eq!(report.network_profile, NetworkProfile::Online);

        ctx.config.sync.dry_run = true;
        assert!(evaluate(&ctx, &inputs, &[], 0).passed);
    }

    #[test]
    fn offline_policy_decides_hardness() {
        let (_dir, ctx, inputs) = setup();
        let mut ctx = ctx
            .with_network_probe(Arc::new(MockNetworkProbe::offline()))
            .with_token_source(Arc::new(StaticTokenSource::new("t")));
        ctx.config.sync.enabled = true;

        ctx.config.preflight.offline_policy = OfflinePolicy::Defer;
        let report = evaluate(&ctx, &inputs, &[], 0);
        assert!(report.passed);
        assert!(report.warnings[0].starts_with("check_network_profile"));

        ctx.config.preflight.offline_policy = OfflinePolicy::Fail;
        let report = evaluate(&ctx, &inputs, &[], 0);
        assert!(!report.passed);
        assert_eq!(report.network_profile, NetworkProfile::Offline);
    }

    #[test]
    fn rule_prefixes_and_modes() {
        let (_dir, mut ctx, inputs) = setup();
        let ctx_ocr_missing = ctx.clone().with_ocr_tool(Arc::new(MockOcrTool::unavailable()));
        let rules = vec![
            "hard:require_ocr_available".to_string(),
            "warn:require_ocr_available".to_string(),
        ];
        let report = evaluate(&ctx_ocr_missing, &inputs, &rules, 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.errors[0].starts_with("lesson:hard:require_ocr_available"));

        ctx.config.preflight.rule_mode = RuleMode::Warn;
        let ctx_warn = ctx.with_ocr_tool(Arc::new(MockOcrTool::unavailable()));
        let report = evaluate(&ctx_warn, &inputs, &rules, 0);
        assert!(report.passed);
        let hard_rule = report.check("lesson:hard:require_ocr_available").unwrap();
        assert!(hard_rule.configured_hard);
        assert!(!hard_rule.hard);
    }

    #[test]
    fn downgrade_can_be_disabled() {
        let (_dir, mut ctx, inputs) = setup();
        ctx.config.preflight.rule_mode = RuleMode::Warn;
        ctx.config.preflight.allow_hard_rule_downgrade = false;
        let report = evaluate(&ctx, &inputs, &["hard:require_sync_disabled".into()], 0);
        assert!(report.passed);

        ctx.config.sync.enabled = true;
        ctx.config.sync.dry_run = true;
        let report = evaluate(&ctx, &inputs, &["hard:require_sync_disabled".into()], 0);
        assert!(!report.passed);
    }

    #[test]
    fn unknown_rule_never_fatal() {
        let (_dir, ctx, inputs) = setup();
        let report = evaluate(&ctx, &inputs, &["hard:launch_rockets".into()], 0);
        assert!(report.passed);
        let check = report.check("lesson:hard:launch_rockets").unwrap();
        assert!(!check.ok);
        assert_eq!(check.detail, "unknown block rule");
    }

    #[test]
    fn parametrised_rules() {
        let (_dir, ctx, inputs) = setup();
        let report = evaluate(
            &ctx,
            &inputs,
            &["max_sync_queue_backlog=0".into(), "min_free_disk_mb=0".into()],
            1,
        );
        assert!(!report.check("lesson:max_sync_queue_backlog=0").unwrap().ok);
        assert!(report.check("lesson:min_free_disk_mb=0").unwrap().ok);
        assert_eq!(
            BlockRule::parse("min_free_disk_mb=abc").kind,
            BlockRuleKind::Unknown
        );
    }

    #[test]
    fn auth_rule_passes_when_sync_disabled() {
        let (_dir, ctx, inputs) = setup();
        let report = evaluate(&ctx, &inputs, &["hard:require_auth_token".into()], 0);
        let check = report.check("lesson:hard:require_auth_token").unwrap();
        assert!(check.ok);
        assert_eq!(check.detail, "sync disabled");
    }

    #[test]
    fn network_rule_triggers_probe() {
        let (_dir, ctx, inputs) = setup();
        let ctx = ctx.with_network_probe(Arc::new(MockNetworkProbe::offline()));
        let report = evaluate(&ctx, &inputs, &["require_network_online".into()], 0);
        assert_eq!(report.network_profile, NetworkProfile::Offline);
        assert!(!report.passed);
    }

    #[test]
    fn runtime_failure_flips_passed() {
        let mut report = PreflightReport::default();
        report.record_runtime_failure(CHECK_OCR_RUNTIME_AVAILABLE, "yomitoku unavailable");
        assert!(!report.passed);
        assert_eq!(
            report.errors,
            vec!["check_ocr_runtime_available: yomitoku unavailable"]
        );
    }

    #[test]
    fn run_preflight_reads_lessons_and_queue() {
        let (_dir, ctx, inputs) = setup();
        std::fs::create_dir_all(ctx.config.state_dir()).unwrap();
        std::fs::write(
            ctx.config.lessons_path(),
            "# Lessons\n\n## Lesson run-1\n- recorded_at: 2024-01-01T00:00:00+00:00\n- category: ocr\n- block_rule: require_ocr_available\n",
        )
        .unwrap();
        let report = run_preflight(&ctx, &inputs);
        assert!(report.check("lesson:require_ocr_available").is_some());
    }
}
