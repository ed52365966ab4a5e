//! End-to-end: ingest a directory of PDFs, sync the run, then inspect it.

use std::sync::Arc;

use ingestops_lib::artifacts::{self, Manifest, TraceEvent, MANIFEST, TRACE};
use ingestops_lib::context::FixedClock;
use ingestops_lib::pipeline::extract::{MockOcrTool, MockPdfBackend};
use ingestops_lib::preflight::auth::StaticTokenSource;
use ingestops_lib::preflight::network::MockNetworkProbe;
use ingestops_lib::sync::{MockRemoteStore, SyncClient, SyncStateKind};
use ingestops_lib::{contract, doctor, OpsConfig, OpsContext, Orchestrator, RunRequest};

fn page(word: &str) -> String {
    format!("{word} ").repeat(80)
}

struct Setup {
    dir: tempfile::TempDir,
    ctx: OpsContext,
    remote: Arc<MockRemoteStore>,
    ocr: Arc<MockOcrTool>,
}

fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let mut config = OpsConfig::default();
    config.runs_dir = dir.path().join("runs");
    config.project = "contracts".into();
    config.preflight.min_free_disk_mb = 0;
    config.sync.chunk_size_bytes = 64;
    config.sync.backoff_base_ms = 1;
    config.sync.backoff_max_ms = 2;

    let remote = Arc::new(MockRemoteStore::new());
    let ocr = Arc::new(MockOcrTool::new(&page("scanned")));
    let pdf = MockPdfBackend::new()
        .with_pages("invoice.pdf", &[&page("invoice"), &page("total")])
        .with_pages("scan.pdf", &["", "", ""]);

    // Build with sync off so no HTTP store is constructed, then enable it.
    let ctx = OpsContext::new(config.clone())
        .unwrap()
        .with_clock(Arc::new(FixedClock::at("2024-06-03T09:30:00Z")))
        .with_pdf_backend(Arc::new(pdf))
        .with_ocr_tool(ocr.clone())
        .with_network_probe(Arc::new(MockNetworkProbe::online()))
        .with_token_source(Arc::new(StaticTokenSource::new("test-token")))
        .with_remote(remote.clone());
    config.sync.enabled = true;
    let ctx = OpsContext { config, ..ctx };

    let inputs = dir.path().join("inbox");
    std::fs::create_dir_all(&inputs).unwrap();
    std::fs::write(inputs.join("invoice.pdf"), "%PDF-1.7 invoice").unwrap();
    std::fs::write(inputs.join("scan.pdf"), "%PDF-1.7 scan").unwrap();
    std::fs::write(inputs.join("readme.txt"), "not a pdf").unwrap();

    Setup {
        dir,
        ctx,
        remote,
        ocr,
    }
}

#[test]
fn full_run_commits_locally_and_remotely() {
    let s = setup();
    let request = RunRequest::new(vec![s.dir.path().join("inbox")]).with_run_id("2024-06-03-a");
    let outcome = Orchestrator::new(&s.ctx).run(&request).unwrap();

    assert!(outcome.succeeded(), "{:?}", outcome.failure);
    assert_eq!(s.ocr.calls(), 1);

    let sync = outcome.sync.as_ref().expect("sync ran");
    assert_eq!(sync.state, SyncStateKind::Committed);
    assert!(sync.is_committed());

    let local: Manifest = artifacts::read_json(&outcome.run_dir.join(MANIFEST)).unwrap();
    assert!(local.committed);
    assert!(local.committed_drive);
    assert_eq!(local.inputs.len(), 2);

    let run_folder = s
        .remote
        .folder_at(&["contracts", "2024-06-03-a"])
        .expect("remote run folder");
    let remote_manifest: Manifest =
        serde_json::from_slice(&s.remote.file_content(&run_folder, MANIFEST).unwrap()).unwrap();
    assert!(remote_manifest.committed_drive);
    assert_eq!(remote_manifest.outputs, local.outputs);

    let stages: Vec<String> = artifacts::read_jsonl::<TraceEvent>(&outcome.run_dir.join(TRACE))
        .unwrap()
        .into_iter()
        .map(|e| e.stage_id)
        .collect();
    assert_eq!(stages.first().map(String::as_str), Some("discover_inputs"));
    assert_eq!(stages.last().map(String::as_str), Some("sync"));

    let report = contract::validate_run_dir(&outcome.run_dir, true).unwrap();
    assert!(report.is_valid(), "{:?}", report.violations);
}

#[test]
fn resync_is_idempotent_and_doctor_sees_the_commit() {
    let s = setup();
    let request = RunRequest::new(vec![s.dir.path().join("inbox")]).with_run_id("2024-06-03-b");
    let outcome = Orchestrator::new(&s.ctx).run(&request).unwrap();
    assert!(outcome.sync.as_ref().unwrap().is_committed());

    let puts = s.remote.chunk_puts();
    let again = SyncClient::new(&s.ctx).sync_run(&outcome.run_dir).unwrap();
    assert_eq!(again.state, SyncStateKind::Committed);
    assert!(again.uploaded.is_empty());
    assert_eq!(s.remote.chunk_puts(), puts);

    let report = doctor::run_doctor(&s.ctx);
    assert_eq!(report.backlog, 0);
    assert_eq!(report.scoreboard.runs, 1);
    assert_eq!(report.scoreboard.committed_rate(), Some(1.0));
    assert_eq!(report.scoreboard.ocr_failure_rate(), Some(0.0));
    assert!(report.to_markdown().contains("## Next commands"));
}
