//! Escalation of audit failures back into planning.
//!
//! A NO-GO audit produces an [`Escalation`] naming the failing stage, its
//! findings and the artifacts involved. The escalation goes to a
//! [`PlanningCollaborator`], which may answer with a [`RevisedTask`]; the
//! dispatcher submits that revision as a new task in a child session.

use async_trait::async_trait;
use baton_audit::{AuditResult, AuditStage, Finding, Severity};
use baton_core::{ArtifactRef, BatonError, BatonResult, Priority, Task, TaskRecord};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Structured failure record sent to the planning collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    /// Escalation id.
    pub id: Uuid,
    /// Task whose output failed the audit.
    pub task_id: Uuid,
    /// Session of that task.
    pub session_id: Uuid,
    /// Audit that failed.
    pub audit_id: Uuid,
    /// First failing stage.
    pub failing_stage: Option<AuditStage>,
    /// Highest severity among the findings.
    pub severity: Option<Severity>,
    /// Findings of the audit.
    pub findings: Vec<Finding>,
    /// Artifacts the audit looked at.
    pub affected_artifacts: Vec<ArtifactRef>,
    /// When the escalation was raised.
    pub created_at: DateTime<Utc>,
}

impl Escalation {
    /// Builds the escalation for a NO-GO audit of `task`.
    pub fn for_audit(task: &Task, audit: &AuditResult, artifacts: &[ArtifactRef]) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task.id,
            session_id: task.session_id,
            audit_id: audit.id,
            failing_stage: audit.failing_stage(),
            severity: audit.max_severity(),
            findings: audit.findings.clone(),
            affected_artifacts: artifacts.to_vec(),
            created_at: Utc::now(),
        }
    }
}

/// How an escalation was dealt with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EscalationResolution {
    /// The revision was submitted as a new task.
    Resubmitted {
        /// The new task.
        task_id: Uuid,
    },
    /// The planner had no revision to offer.
    Declined,
    /// The replan ceiling was reached.
    Exhausted,
    /// The planner could not be reached or answered badly.
    PlanningFailed {
        /// What went wrong.
        message: String,
    },
}

/// Append-only log of escalations and their resolutions.
#[derive(Default)]
pub struct EscalationLog {
    entries: RwLock<Vec<Escalation>>,
    resolutions: RwLock<HashMap<Uuid, EscalationResolution>>,
}

impl EscalationLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an escalation.
    pub fn append(&self, escalation: Escalation) {
        info!(
            escalation_id = %escalation.id,
            task_id = %escalation.task_id,
            failing_stage = ?escalation.failing_stage,
            findings = escalation.findings.len(),
            "EscalationLog: escalation raised"
        );
        self.entries.write().push(escalation);
    }

    /// Records how an escalation ended. Later calls do not overwrite.
    pub fn resolve(&self, escalation_id: Uuid, resolution: EscalationResolution) {
        self.resolutions
            .write()
            .entry(escalation_id)
            .or_insert(resolution);
    }

    /// Escalation by id.
    pub fn get(&self, escalation_id: Uuid) -> Option<Escalation> {
        self.entries
            .read()
            .iter()
            .find(|e| e.id == escalation_id)
            .cloned()
    }

    /// Resolution of an escalation.
    pub fn resolution(&self, escalation_id: Uuid) -> Option<EscalationResolution> {
        self.resolutions.read().get(&escalation_id).cloned()
    }

    /// Escalations raised for a task.
    pub fn for_task(&self, task_id: Uuid) -> Vec<Escalation> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Every escalation, oldest first.
    pub fn all(&self) -> Vec<Escalation> {
        self.entries.read().clone()
    }

    /// Number of escalations.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// A revised task definition proposed by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisedTask {
    /// New target; the original target when absent.
    #[serde(default)]
    pub to_agent: Option<String>,
    /// New task type; the original type when absent.
    #[serde(default)]
    pub task_type: Option<String>,
    /// Revised parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// New priority; the original priority when absent.
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// Planning stage outside the core that turns escalations into revised
/// work.
#[async_trait]
pub trait PlanningCollaborator: Send + Sync {
    /// Returns a revision, or `None` when there is nothing to resubmit.
    async fn revise(&self, escalation: &Escalation, task: &Task) -> BatonResult<Option<RevisedTask>>;
}

/// Planner that never revises. Escalations are logged and left there.
pub struct NullPlanner;

#[async_trait]
impl PlanningCollaborator for NullPlanner {
    async fn revise(&self, escalation: &Escalation, _task: &Task) -> BatonResult<Option<RevisedTask>> {
        debug!(escalation_id = %escalation.id, "NullPlanner: no revision");
        Ok(None)
    }
}

#[derive(Serialize)]
struct PlanningRequest<'a> {
    escalation: &'a Escalation,
    task: TaskRecord,
}

/// Planner reached over HTTP.
///
/// `POST {url}` with `{"escalation": ..., "task": ...}`; `200` carries a
/// [`RevisedTask`], `204` means no revision.
pub struct HttpPlanner {
    url: String,
    http: reqwest::Client,
}

impl HttpPlanner {
    /// Creates a planner client with a per-request timeout.
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> BatonResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BatonError::Http(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl PlanningCollaborator for HttpPlanner {
    async fn revise(&self, escalation: &Escalation, task: &Task) -> BatonResult<Option<RevisedTask>> {
        debug!(url = %self.url, escalation_id = %escalation.id, "HttpPlanner: sending escalation");
        let body = PlanningRequest {
            escalation,
            task: TaskRecord::from(task),
        };
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BatonError::Planning(format!("planner unreachable: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BatonError::Planning(format!("planner answered {status}: {text}")));
        }
        resp.json::<RevisedTask>()
            .await
            .map(Some)
            .map_err(|e| BatonError::Planning(format!("invalid revision: {e}")))
    }
}
