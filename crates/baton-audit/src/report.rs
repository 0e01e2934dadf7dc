use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three audit stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    /// Static scan for placeholder and metric-gaming patterns.
    TheaterScan,
    /// Execution inside the sandbox.
    Sandbox,
    /// Weighted structural checks.
    Compliance,
}

impl AuditStage {
    /// All stages in order.
    pub const ALL: [AuditStage; 3] = [
        AuditStage::TheaterScan,
        AuditStage::Sandbox,
        AuditStage::Compliance,
    ];
}

impl std::fmt::Display for AuditStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditStage::TheaterScan => write!(f, "theater_scan"),
            AuditStage::Sandbox => write!(f, "sandbox"),
            AuditStage::Compliance => write!(f, "compliance"),
        }
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    /// The stage ran and passed.
    Passed,
    /// The stage ran and failed.
    Failed,
    /// The stage did not run.
    Skipped,
}

/// Per-stage entry of an [`AuditResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    /// Stage.
    pub stage: AuditStage,
    /// Outcome.
    pub outcome: StageOutcome,
    /// Stage score, when the stage produces one.
    pub score: Option<f64>,
    /// Wall-clock time spent in the stage.
    pub duration_ms: u64,
}

impl StageReport {
    /// Report for a stage that never ran.
    pub fn skipped(stage: AuditStage) -> Self {
        Self {
            stage,
            outcome: StageOutcome::Skipped,
            score: None,
            duration_ms: 0,
        }
    }
}

/// Severity of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// Minor.
    Low,
    /// Worth fixing.
    Medium,
    /// Fails the stage on its own in most configurations.
    High,
    /// The artifact cannot be trusted.
    Critical,
}

/// One diagnostic produced by a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Stage that produced it.
    pub stage: AuditStage,
    /// Rule or check id, e.g. `always-true-assert`.
    pub rule: String,
    /// Severity.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Artifact file the finding points into.
    #[serde(default)]
    pub file: Option<String>,
    /// 1-based line number.
    #[serde(default)]
    pub line: Option<usize>,
}

impl Finding {
    /// Finding without a source position.
    pub fn new(
        stage: AuditStage,
        rule: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            rule: rule.into(),
            severity,
            message: message.into(),
            file: None,
            line: None,
        }
    }

    /// Attaches a source position.
    pub fn at(mut self, file: impl Into<String>, line: usize) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }
}

/// Aggregate audit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    /// Passed every stage with a compliance score at or above the GO bar.
    Go,
    /// Passed, but the compliance score needs an explicit accept or reject.
    Caution,
    /// Failed a stage or scored below the CAUTION bar.
    NoGo,
}

impl std::fmt::Display for AuditDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditDecision::Go => write!(f, "GO"),
            AuditDecision::Caution => write!(f, "CAUTION"),
            AuditDecision::NoGo => write!(f, "NO-GO"),
        }
    }
}

/// Outcome of one audit attempt for one task. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResult {
    /// Audit id.
    pub id: Uuid,
    /// Audited task.
    pub task_id: Uuid,
    /// Attempt number within the task's audit history.
    pub attempt: u32,
    /// One report per stage, in stage order.
    pub stages: Vec<StageReport>,
    /// Aggregate decision.
    pub decision: AuditDecision,
    /// Diagnostics from every stage that ran.
    pub findings: Vec<Finding>,
    /// Escalation raised for a NO-GO.
    #[serde(default)]
    pub escalation: Option<Uuid>,
    /// When the audit finished.
    pub created_at: DateTime<Utc>,
}

impl AuditResult {
    /// Report for `stage`.
    pub fn stage(&self, stage: AuditStage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// First stage that failed.
    pub fn failing_stage(&self) -> Option<AuditStage> {
        self.stages
            .iter()
            .find(|s| s.outcome == StageOutcome::Failed)
            .map(|s| s.stage)
    }

    /// Findings produced by `stage`.
    pub fn findings_for(&self, stage: AuditStage) -> Vec<&Finding> {
        self.findings.iter().filter(|f| f.stage == stage).collect()
    }

    /// Highest severity among the findings.
    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Explicit accept or reject of a CAUTION result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CautionDecision {
    /// Audit being decided.
    pub audit_id: Uuid,
    /// Task the audit belongs to.
    pub task_id: Uuid,
    /// Whether the result was accepted.
    pub accepted: bool,
    /// Who decided.
    pub reviewer: String,
    /// When.
    pub decided_at: DateTime<Utc>,
}
