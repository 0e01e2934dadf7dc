#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use baton_audit::{
    ArtifactStore, AuditConfig, AuditDecision, AuditPipeline, AuditResultStore, AuditStage,
    InMemoryArtifactStore, ProcessSandbox, ProcessSandboxConfig, Sandbox, SandboxLimits,
    SandboxReport, SandboxRequest, StageOutcome,
};
use baton_core::{BatonError, BatonResult, ProtocolBinding, Task};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn task() -> Task {
    Task::new(
        Uuid::new_v4(),
        "coordinator",
        "coder",
        "implement",
        ProtocolBinding::Internal,
        chrono::Duration::minutes(5),
    )
}

async fn with_artifact(
    store: &InMemoryArtifactStore,
    kind: &str,
    name: &str,
    content: &str,
) -> Task {
    let mut task = task();
    let artifact = store
        .put(task.id, kind, name, content.as_bytes())
        .await
        .unwrap();
    task.artifacts.push(artifact);
    task
}

fn process_sandbox() -> Arc<dyn Sandbox> {
    Arc::new(
        ProcessSandbox::new(ProcessSandboxConfig {
            isolate_network: false,
            ..ProcessSandboxConfig::default()
        })
        .unwrap(),
    )
}

/// Records every request and answers with a fixed outcome.
struct CountingSandbox {
    calls: AtomicUsize,
    cancelled: bool,
}

impl CountingSandbox {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            cancelled: false,
        }
    }
}

#[async_trait]
impl Sandbox for CountingSandbox {
    fn name(&self) -> &str {
        "counting"
    }

    async fn execute(
        &self,
        request: &SandboxRequest,
        _cancel: &CancellationToken,
    ) -> BatonResult<SandboxReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.cancelled {
            return Err(BatonError::Cancelled(format!("run for {}", request.task_id)));
        }
        Ok(SandboxReport {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
        })
    }
}

const CLEAN_SCRIPT: &str = "#!/bin/sh\nset -e\necho \"sum: $((2 + 2))\"\n";

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_clean_script_is_go() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let task = with_artifact(&store, "script", "run.sh", CLEAN_SCRIPT).await;
    let pipeline = AuditPipeline::new(store, process_sandbox(), AuditConfig::default()).unwrap();

    let result = pipeline
        .audit(&task, 1, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.decision, AuditDecision::Go, "{result:?}");
    assert_eq!(result.task_id, task.id);
    assert_eq!(result.attempt, 1);
    let order: Vec<AuditStage> = result.stages.iter().map(|s| s.stage).collect();
    assert_eq!(order, AuditStage::ALL.to_vec());
    assert!(result
        .stages
        .iter()
        .all(|s| s.outcome == StageOutcome::Passed));
    assert_eq!(result.stage(AuditStage::TheaterScan).unwrap().score, Some(0.0));

    let metrics = pipeline.metrics();
    assert_eq!(metrics.sandbox.passed, 1);
    assert_eq!(metrics.go, 1);
}

#[tokio::test]
async fn test_ignored_failure_is_caution_and_reviewable() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let script = "#!/bin/sh\nrm -f missing.txt || true\necho done\n";
    let task = with_artifact(&store, "script", "cleanup.sh", script).await;
    let pipeline = AuditPipeline::new(store, process_sandbox(), AuditConfig::default()).unwrap();

    let result = pipeline
        .audit(&task, 1, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.decision, AuditDecision::Caution, "{result:?}");
    let compliance = result.stage(AuditStage::Compliance).unwrap();
    assert!((compliance.score.unwrap() - 0.94).abs() < 1e-9);
    assert_eq!(result.findings_for(AuditStage::Compliance)[0].rule, "ignored-failure");

    let audits = AuditResultStore::new();
    audits.record(result.clone()).unwrap();
    assert_eq!(audits.pending_cautions().len(), 1);
    let decision = audits.decide_caution(result.id, true, "lead").unwrap();
    assert!(decision.accepted);
    assert!(audits.decide_caution(result.id, false, "lead").is_err());
}

#[tokio::test]
async fn test_result_payload_audited_without_sandbox() {
    let sandbox = Arc::new(CountingSandbox::new());
    let pipeline = AuditPipeline::new(
        Arc::new(InMemoryArtifactStore::new()),
        sandbox.clone(),
        AuditConfig::default(),
    )
    .unwrap();
    let mut task = task();
    task.result = Some(serde_json::json!({"verdict": "approve", "notes": "looks right"}));

    let result = pipeline
        .audit(&task, 1, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.decision, AuditDecision::Go);
    assert_eq!(
        result.stage(AuditStage::Sandbox).unwrap().outcome,
        StageOutcome::Skipped
    );
    assert_eq!(sandbox.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_task_without_output_is_no_go() {
    let pipeline = AuditPipeline::new(
        Arc::new(InMemoryArtifactStore::new()),
        Arc::new(CountingSandbox::new()),
        AuditConfig::default(),
    )
    .unwrap();
    let result = pipeline
        .audit(&task(), 1, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.decision, AuditDecision::NoGo);
    assert_eq!(result.failing_stage(), Some(AuditStage::TheaterScan));
    assert!(result.findings.iter().any(|f| f.rule == "no-output"));
}

// ---------------------------------------------------------------------------
// Short-circuiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_theater_failure_skips_later_stages() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let code = "def test_add():\n    assert True\n    print(\"All tests passed\")\n";
    let task = with_artifact(&store, "python", "test_add.py", code).await;
    let sandbox = Arc::new(CountingSandbox::new());
    let pipeline = AuditPipeline::new(store, sandbox.clone(), AuditConfig::default()).unwrap();

    let result = pipeline
        .audit(&task, 2, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.decision, AuditDecision::NoGo);
    assert_eq!(result.failing_stage(), Some(AuditStage::TheaterScan));
    assert_eq!(result.stage(AuditStage::TheaterScan).unwrap().score, Some(50.0));
    assert_eq!(
        result.stage(AuditStage::Sandbox).unwrap().outcome,
        StageOutcome::Skipped
    );
    assert_eq!(
        result.stage(AuditStage::Compliance).unwrap().outcome,
        StageOutcome::Skipped
    );
    assert_eq!(sandbox.calls.load(Ordering::SeqCst), 0);
    assert!(result
        .findings
        .iter()
        .any(|f| f.rule == "always-true-assert" && f.line == Some(2)));

    let metrics = pipeline.metrics();
    assert_eq!(metrics.theater_scan.failed, 1);
    assert_eq!(metrics.sandbox.skipped, 1);
    assert_eq!(metrics.compliance.skipped, 1);
    assert_eq!(metrics.no_go, 1);
}

#[tokio::test]
async fn test_tampered_artifact_is_no_go() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let task = with_artifact(&store, "script", "run.sh", CLEAN_SCRIPT).await;
    assert!(store.tamper(&task.artifacts[0].location, b"echo swapped\n"));
    let sandbox = Arc::new(CountingSandbox::new());
    let pipeline = AuditPipeline::new(store, sandbox.clone(), AuditConfig::default()).unwrap();

    let result = pipeline
        .audit(&task, 1, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.decision, AuditDecision::NoGo);
    assert!(result.findings.iter().any(|f| f.rule == "artifact-integrity"));
    assert_eq!(sandbox.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_sandbox_timeout_is_no_go() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let task = with_artifact(&store, "script", "slow.sh", "#!/bin/sh\nsleep 5\n").await;
    let config = AuditConfig {
        limits: SandboxLimits {
            timeout_ms: 300,
            ..SandboxLimits::default()
        },
        ..AuditConfig::default()
    };
    let pipeline = AuditPipeline::new(store, process_sandbox(), config).unwrap();

    let started = Instant::now();
    let result = pipeline
        .audit(&task, 1, &CancellationToken::new())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(4));

    assert_eq!(result.decision, AuditDecision::NoGo);
    assert_eq!(result.failing_stage(), Some(AuditStage::Sandbox));
    assert_eq!(
        result.stage(AuditStage::Compliance).unwrap().outcome,
        StageOutcome::Skipped
    );
    let faults = result.findings_for(AuditStage::Sandbox);
    let fault = faults[0];
    assert_eq!(fault.rule, "sandbox-fault");
    assert!(fault.message.contains("timed out"), "{}", fault.message);
}

#[tokio::test]
async fn test_failing_script_is_no_go() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let script = "#!/bin/sh\necho \"bad input\" >&2\nexit 3\n";
    let task = with_artifact(&store, "script", "check.sh", script).await;
    let pipeline = AuditPipeline::new(store, process_sandbox(), AuditConfig::default()).unwrap();

    let result = pipeline
        .audit(&task, 1, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.decision, AuditDecision::NoGo);
    let findings = result.findings_for(AuditStage::Sandbox);
    let finding = findings[0];
    assert_eq!(finding.rule, "nonzero-exit");
    assert!(finding.message.contains("status 3"));
    assert!(finding.message.contains("bad input"));
}

#[tokio::test]
async fn test_cancelled_audit_records_nothing() {
    let store = Arc::new(InMemoryArtifactStore::new());
    let task = with_artifact(&store, "script", "run.sh", CLEAN_SCRIPT).await;
    let sandbox = Arc::new(CountingSandbox {
        calls: AtomicUsize::new(0),
        cancelled: true,
    });
    let pipeline = AuditPipeline::new(store, sandbox, AuditConfig::default()).unwrap();

    let err = pipeline
        .audit(&task, 1, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BatonError::Cancelled(_)));
    let metrics = pipeline.metrics();
    assert_eq!(metrics.go + metrics.caution + metrics.no_go, 0);
}

// ---------------------------------------------------------------------------
// Resource cleanup
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
fn is_live(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| stat.rsplit_once(") ").map(|(_, rest)| !rest.starts_with('Z')))
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
async fn wait_gone(pid: u32) -> bool {
    for _ in 0..100 {
        if !is_live(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[cfg(target_os = "linux")]
fn marker_request(script: &str, timeout_ms: u64) -> SandboxRequest {
    SandboxRequest {
        task_id: Uuid::new_v4(),
        command: vec!["sh".into(), "run.sh".into()],
        inputs: vec![baton_audit::SandboxInput {
            name: "run.sh".into(),
            content: script.as_bytes().to_vec(),
        }],
        limits: SandboxLimits {
            timeout_ms,
            ..SandboxLimits::default()
        },
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_grandchildren_do_not_outlive_a_clean_run() {
    // The nested shell exits at once, leaving its sleep orphaned.
    let script = "sh -c 'sleep 317 & echo \"$!\"'\npwd\n";
    let report = process_sandbox()
        .execute(&marker_request(script, 10_000), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.success());

    let lines: Vec<&str> = report.stdout.lines().collect();
    assert_eq!(lines.len(), 2, "{}", report.stdout);
    let pid: u32 = lines[0].parse().unwrap();
    assert!(wait_gone(pid).await, "grandchild {pid} survived the run");
    assert!(!std::path::Path::new(lines[1]).exists());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_cancelled_run_releases_processes_and_scratch() {
    let marks = tempfile::tempdir().unwrap();
    let pid_file = marks.path().join("bg.pid");
    let dir_file = marks.path().join("scratch.dir");
    let script = format!(
        "sh -c 'sleep 317 & echo \"$!\" > {}'\npwd > '{}'\nsleep 30\n",
        pid_file.display(),
        dir_file.display()
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watched = dir_file.clone();
    tokio::spawn(async move {
        while !watched.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = process_sandbox()
        .execute(&marker_request(&script, 20_000), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, BatonError::Cancelled(_)), "{err}");

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(wait_gone(pid).await, "grandchild {pid} survived cancellation");
    let scratch = std::fs::read_to_string(&dir_file).unwrap();
    assert!(!std::path::Path::new(scratch.trim()).exists());
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn test_config_defaults_and_validation() {
    let config: AuditConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config, AuditConfig::default());
    assert_eq!(config.theater_threshold, 40.0);
    assert_eq!(config.runners["script"], vec!["sh".to_string()]);

    let bad = AuditConfig {
        theater_threshold: 0.0,
        ..AuditConfig::default()
    };
    let built = AuditPipeline::new(
        Arc::new(InMemoryArtifactStore::new()),
        Arc::new(CountingSandbox::new()),
        bad,
    );
    assert!(matches!(built, Err(BatonError::Config(_))));
}
