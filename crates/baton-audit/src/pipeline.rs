use crate::artifact_store::{artifact_name, ArtifactStore};
use crate::compliance::{ComplianceScorer, ComplianceWeights};
use crate::metrics::{AuditMetrics, AuditMetricsSnapshot};
use crate::report::{
    AuditDecision, AuditResult, AuditStage, Finding, Severity, StageOutcome, StageReport,
};
use crate::sandbox::{Sandbox, SandboxInput, SandboxLimits, SandboxRequest};
use crate::theater::{TheaterScanner, DEFAULT_THEATER_THRESHOLD};
use baton_core::{BatonError, BatonResult, Task};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Audit pipeline configuration (`[audit]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Theater score above which stage 1 fails.
    #[serde(default = "default_theater_threshold")]
    pub theater_threshold: f64,
    /// Compliance check weights.
    #[serde(default)]
    pub weights: ComplianceWeights,
    /// Compliance score for GO.
    #[serde(default = "default_go_threshold")]
    pub go_threshold: f64,
    /// Compliance score for CAUTION.
    #[serde(default = "default_caution_threshold")]
    pub caution_threshold: f64,
    /// Sandbox limits applied to every run.
    #[serde(default)]
    pub limits: SandboxLimits,
    /// Artifact kind to the interpreter that runs it. Kinds not listed
    /// here are not executable and skip stage 2.
    #[serde(default = "default_runners")]
    pub runners: BTreeMap<String, Vec<String>>,
}

fn default_theater_threshold() -> f64 {
    DEFAULT_THEATER_THRESHOLD
}
fn default_go_threshold() -> f64 {
    ComplianceScorer::GO
}
fn default_caution_threshold() -> f64 {
    ComplianceScorer::CAUTION
}
fn default_runners() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([
        ("script".to_string(), vec!["sh".to_string()]),
        ("python".to_string(), vec!["python3".to_string()]),
        ("node".to_string(), vec!["node".to_string()]),
    ])
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            theater_threshold: default_theater_threshold(),
            weights: ComplianceWeights::default(),
            go_threshold: default_go_threshold(),
            caution_threshold: default_caution_threshold(),
            limits: SandboxLimits::default(),
            runners: default_runners(),
        }
    }
}

struct Source {
    name: String,
    kind: String,
    content: Vec<u8>,
}

impl Source {
    fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// Runs the three audit stages in order, stopping at the first failure.
pub struct AuditPipeline {
    store: Arc<dyn ArtifactStore>,
    sandbox: Arc<dyn Sandbox>,
    scanner: TheaterScanner,
    scorer: ComplianceScorer,
    config: AuditConfig,
    metrics: AuditMetrics,
}

impl AuditPipeline {
    /// Builds a pipeline; fails on an invalid threshold or weight.
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        sandbox: Arc<dyn Sandbox>,
        config: AuditConfig,
    ) -> BatonResult<Self> {
        let scanner = TheaterScanner::new(config.theater_threshold)?;
        let scorer = ComplianceScorer::with_thresholds(
            config.weights.clone(),
            config.go_threshold,
            config.caution_threshold,
        )?;
        if config.runners.values().any(Vec::is_empty) {
            return Err(BatonError::Config("audit runner commands must not be empty".into()));
        }
        Ok(Self {
            store,
            sandbox,
            scanner,
            scorer,
            config,
            metrics: AuditMetrics::default(),
        })
    }

    /// Artifact store the pipeline reads from.
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Stage counters.
    pub fn metrics(&self) -> AuditMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Audits what `task` produced: its artifacts, or its result payload
    /// when it has none.
    ///
    /// Returns `Cancelled` without a result if `cancel` fires; every other
    /// failure, sandbox faults included, ends up in the returned result.
    pub async fn audit(
        &self,
        task: &Task,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> BatonResult<AuditResult> {
        let mut stages = Vec::with_capacity(3);
        let mut findings = Vec::new();

        // Stage 1
        let started = Instant::now();
        let (sources, mut load_findings) = self.collect(task).await?;
        let mut score = 0.0_f64;
        for source in &sources {
            let report = self.scanner.scan(&source.name, &source.text());
            score = score.max(report.score);
            findings.extend(report.findings);
        }
        let loaded = load_findings.is_empty();
        findings.append(&mut load_findings);
        let passed = loaded && !self.scanner.fails(score);
        if loaded && !passed {
            findings.push(Finding::new(
                AuditStage::TheaterScan,
                "theater-threshold",
                Severity::High,
                format!(
                    "theater score {score} exceeds threshold {}",
                    self.scanner.threshold()
                ),
            ));
        }
        stages.push(StageReport {
            stage: AuditStage::TheaterScan,
            outcome: outcome(passed),
            score: Some(score),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        if !passed {
            return Ok(self.finish(task, attempt, stages, findings, AuditDecision::NoGo));
        }
        check_cancelled(task, cancel)?;

        // Stage 2
        let started = Instant::now();
        let executables: Vec<&Source> = sources
            .iter()
            .filter(|s| self.config.runners.contains_key(&s.kind))
            .collect();
        if executables.is_empty() {
            stages.push(StageReport::skipped(AuditStage::Sandbox));
        } else {
            let mut failure = None;
            for exe in executables {
                if let Some(finding) = self.execute(task, exe, &sources, cancel).await? {
                    failure = Some(finding);
                    break;
                }
            }
            let passed = failure.is_none();
            findings.extend(failure);
            stages.push(StageReport {
                stage: AuditStage::Sandbox,
                outcome: outcome(passed),
                score: None,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            if !passed {
                return Ok(self.finish(task, attempt, stages, findings, AuditDecision::NoGo));
            }
        }
        check_cancelled(task, cancel)?;

        // Stage 3
        let started = Instant::now();
        let texts: Vec<(String, String)> = sources
            .iter()
            .map(|s| (s.name.clone(), s.text().into_owned()))
            .collect();
        let report = self
            .scorer
            .score(texts.iter().map(|(n, t)| (n.as_str(), t.as_str())));
        findings.extend(report.findings);
        stages.push(StageReport {
            stage: AuditStage::Compliance,
            outcome: outcome(report.decision != AuditDecision::NoGo),
            score: Some(report.score),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(self.finish(task, attempt, stages, findings, report.decision))
    }

    /// Loads every artifact. Unloadable ones become critical findings.
    async fn collect(&self, task: &Task) -> BatonResult<(Vec<Source>, Vec<Finding>)> {
        let mut sources = Vec::new();
        let mut problems = Vec::new();
        let mut names = HashSet::new();

        for (i, artifact) in task.artifacts.iter().enumerate() {
            let mut name = artifact_name(artifact).to_string();
            if !names.insert(name.clone()) {
                name = format!("{i}-{name}");
                names.insert(name.clone());
            }
            match self.store.fetch(artifact).await {
                Ok(content) => sources.push(Source {
                    name,
                    kind: artifact.kind.clone(),
                    content,
                }),
                Err(e @ BatonError::Integrity(_)) => {
                    warn!(task_id = %task.id, artifact = %artifact.id, error = %e, "AuditPipeline: artifact rejected");
                    problems.push(Finding::new(
                        AuditStage::TheaterScan,
                        "artifact-integrity",
                        Severity::Critical,
                        e.to_string(),
                    ));
                }
                Err(e) => return Err(e),
            }
        }

        if task.artifacts.is_empty() {
            match &task.result {
                Some(result) => sources.push(Source {
                    name: "result.json".into(),
                    kind: "result".into(),
                    content: serde_json::to_vec_pretty(result)?,
                }),
                None => problems.push(Finding::new(
                    AuditStage::TheaterScan,
                    "no-output",
                    Severity::Critical,
                    "task produced neither artifacts nor a result",
                )),
            }
        }
        Ok((sources, problems))
    }

    /// Runs one executable artifact. Returns the failure finding, if any.
    async fn execute(
        &self,
        task: &Task,
        exe: &Source,
        sources: &[Source],
        cancel: &CancellationToken,
    ) -> BatonResult<Option<Finding>> {
        let mut command = self.config.runners.get(&exe.kind).cloned().unwrap_or_default();
        command.push(exe.name.clone());
        let request = SandboxRequest {
            task_id: task.id,
            command,
            inputs: sources
                .iter()
                .map(|s| SandboxInput {
                    name: s.name.clone(),
                    content: s.content.clone(),
                })
                .collect(),
            limits: self.config.limits.clone(),
        };
        debug!(task_id = %task.id, artifact = %exe.name, backend = self.sandbox.name(), "AuditPipeline: sandbox run");

        match self.sandbox.execute(&request, cancel).await {
            Ok(report) if report.success() => Ok(None),
            Ok(report) => Ok(Some(
                Finding::new(
                    AuditStage::Sandbox,
                    "nonzero-exit",
                    Severity::High,
                    format!(
                        "{} exited with status {}: {}",
                        exe.name,
                        report.exit_code,
                        report.stderr.trim()
                    ),
                )
                .at(&exe.name, 1),
            )),
            Err(e @ BatonError::Cancelled(_)) => Err(e),
            Err(e) => Ok(Some(
                Finding::new(
                    AuditStage::Sandbox,
                    "sandbox-fault",
                    Severity::High,
                    format!("{}: {e}", exe.name),
                )
                .at(&exe.name, 1),
            )),
        }
    }

    fn finish(
        &self,
        task: &Task,
        attempt: u32,
        mut stages: Vec<StageReport>,
        findings: Vec<Finding>,
        decision: AuditDecision,
    ) -> AuditResult {
        for stage in AuditStage::ALL {
            if !stages.iter().any(|s| s.stage == stage) {
                stages.push(StageReport::skipped(stage));
            }
        }
        for s in &stages {
            self.metrics.record_stage(s.stage, s.outcome);
        }
        self.metrics.record_decision(decision);

        let result = AuditResult {
            id: Uuid::new_v4(),
            task_id: task.id,
            attempt,
            stages,
            decision,
            findings,
            escalation: None,
            created_at: Utc::now(),
        };
        info!(
            task_id = %task.id,
            attempt,
            decision = %decision,
            failing_stage = ?result.failing_stage(),
            findings = result.findings.len(),
            "AuditPipeline: task audited"
        );
        result
    }
}

fn outcome(passed: bool) -> StageOutcome {
    if passed {
        StageOutcome::Passed
    } else {
        StageOutcome::Failed
    }
}

fn check_cancelled(task: &Task, cancel: &CancellationToken) -> BatonResult<()> {
    if cancel.is_cancelled() {
        return Err(BatonError::Cancelled(format!("audit of task {}", task.id)));
    }
    Ok(())
}
