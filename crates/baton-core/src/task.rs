use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, waiting for the target agent to acknowledge.
    Pending,
    /// Acknowledged by the target agent.
    Accepted,
    /// Execution has started.
    InProgress,
    /// Artifact produced and passed audit.
    Completed,
    /// Execution error, audit NO-GO, gateway failure or forced expiry.
    Failed,
    /// Withdrawn before execution started.
    Cancelled,
}

impl TaskState {
    /// All states, in lifecycle order.
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Accepted,
        TaskState::InProgress,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// The ordinary lifecycle table. Forced failure is handled separately by
    /// the ledger and is not part of this table.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Accepted)
                | (TaskState::Pending, TaskState::Cancelled)
                | (TaskState::Accepted, TaskState::InProgress)
                | (TaskState::Accepted, TaskState::Cancelled)
                | (TaskState::InProgress, TaskState::Completed)
                | (TaskState::InProgress, TaskState::Failed)
        )
    }

    /// Whether the task can still be withdrawn by its requester.
    pub fn is_cancellable(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Accepted)
    }

    /// Stable lowercase name, identical to the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Accepted => "accepted",
            TaskState::InProgress => "in_progress",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown task state '{s}'"))
    }
}

/// Task priority. Ordered `Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default priority.
    #[default]
    Medium,
    /// Dispatched first.
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Which protocol an agent speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolBinding {
    /// Low-latency in-process dispatch without lifecycle polling.
    Internal,
    /// Task/message/artifact protocol with polled status updates.
    External,
}

impl std::fmt::Display for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolBinding::Internal => write!(f, "internal"),
            ProtocolBinding::External => write!(f, "external"),
        }
    }
}

/// Why a task ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The worker reported an execution error.
    ExecutionError,
    /// The audit pipeline returned NO-GO.
    AuditNoGo,
    /// A CAUTION audit result was explicitly rejected.
    CautionRejected,
    /// The destination protocol stayed unreachable.
    GatewayUnavailable,
    /// Force-failed by the zombie reaper.
    Expired,
    /// The worker declined the task.
    Rejected,
    /// The execution exceeded its time budget.
    Timeout,
}

impl FailureReason {
    /// Reasons that may fail a task outside the ordinary lifecycle table.
    ///
    /// The reaper expires stuck tasks, the gateway fails tasks the
    /// destination never acknowledged, and the dispatcher fails tasks every
    /// candidate worker declined.
    pub fn may_force(self) -> bool {
        matches!(
            self,
            FailureReason::Expired | FailureReason::GatewayUnavailable | FailureReason::Rejected
        )
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::ExecutionError => "execution_error",
            FailureReason::AuditNoGo => "audit_no_go",
            FailureReason::CautionRejected => "caution_rejected",
            FailureReason::GatewayUnavailable => "gateway_unavailable",
            FailureReason::Expired => "expired",
            FailureReason::Rejected => "rejected",
            FailureReason::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Structured error payload carried by every failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    /// Failure classification.
    pub reason: FailureReason,
    /// Human-readable summary.
    pub message: String,
    /// Arbitrary diagnostic details (findings, stage, attempts).
    #[serde(default)]
    pub details: serde_json::Value,
}

impl TaskError {
    /// Creates an error payload without details.
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Attaches diagnostic details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// An error payload must say something.
    pub fn is_empty(&self) -> bool {
        self.message.trim().is_empty()
    }
}

/// Pointer to an artifact held in external storage. Never carries content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Artifact id.
    pub id: Uuid,
    /// Task that produced the artifact.
    pub task_id: Uuid,
    /// Free-form artifact type tag (e.g. `code`, `report`).
    pub kind: String,
    /// Storage location (key, path or URL).
    pub location: String,
    /// Lowercase hex sha256 of the content.
    pub content_hash: String,
    /// Content size in bytes.
    pub size: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ArtifactRef {
    /// Builds a reference for `content` stored at `location`.
    pub fn for_content(
        task_id: Uuid,
        kind: impl Into<String>,
        location: impl Into<String>,
        content: &[u8],
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            kind: kind.into(),
            location: location.into(),
            content_hash: content_hash(content),
            size: content.len() as u64,
            created_at: Utc::now(),
        }
    }
}

/// Lowercase hex sha256 of `content`.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// A unit of delegated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique id, assigned once.
    pub id: Uuid,
    /// Session context the task belongs to.
    pub session_id: Uuid,
    /// Originating agent.
    pub from_agent: String,
    /// Target agent.
    pub to_agent: String,
    /// Task type tag.
    pub task_type: String,
    /// Opaque structured parameters.
    pub parameters: serde_json::Value,
    /// Dispatch priority.
    pub priority: Priority,
    /// Protocol the target agent speaks.
    pub protocol: ProtocolBinding,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// `created_at` plus the protocol TTL; fixed at creation.
    pub deadline: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// Result payload once produced.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error payload when failed.
    #[serde(default)]
    pub error: Option<TaskError>,
    /// Produced artifacts (references only).
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    /// Task this one was re-planned from, if any.
    #[serde(default)]
    pub parent_task: Option<Uuid>,
    /// Re-plan attempt number (0 for original submissions).
    #[serde(default)]
    pub attempt: u32,
    /// Id assigned by the external protocol, once known.
    #[serde(default)]
    pub external_id: Option<String>,
}

impl Task {
    /// Creates a pending task whose deadline is `created_at + ttl`.
    pub fn new(
        session_id: Uuid,
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        task_type: impl Into<String>,
        protocol: ProtocolBinding,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id,
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            task_type: task_type.into(),
            parameters: serde_json::Value::Null,
            priority: Priority::default(),
            protocol,
            created_at: now,
            deadline: now + ttl,
            state: TaskState::Pending,
            updated_at: now,
            result: None,
            error: None,
            artifacts: Vec::new(),
            parent_task: None,
            attempt: 0,
            external_id: None,
        }
    }

    /// Sets the parameters payload.
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Links the task to the one it was re-planned from.
    pub fn with_parent(mut self, parent: Uuid, attempt: u32) -> Self {
        self.parent_task = Some(parent);
        self.attempt = attempt;
        self
    }

    /// The TTL this task was created with.
    pub fn ttl(&self) -> Duration {
        self.deadline - self.created_at
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    /// Age of the task at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}
