use baton_core::{ArtifactRef, Priority, Task, TaskError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Internal protocol
// ---------------------------------------------------------------------------

/// What an internal worker receives: a direct call with no lifecycle
/// negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalEnvelope {
    /// Task id.
    pub task_id: Uuid,
    /// Session the task belongs to.
    pub session_id: Uuid,
    /// Originating agent.
    pub from_agent: String,
    /// Target agent.
    pub to_agent: String,
    /// Task type tag.
    pub task_type: String,
    /// Opaque parameters.
    pub parameters: serde_json::Value,
    /// Priority.
    pub priority: Priority,
    /// Fixed deadline.
    pub deadline: DateTime<Utc>,
}

impl From<&Task> for InternalEnvelope {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            session_id: task.session_id,
            from_agent: task.from_agent.clone(),
            to_agent: task.to_agent.clone(),
            task_type: task.task_type.clone(),
            parameters: task.parameters.clone(),
            priority: task.priority,
            deadline: task.deadline,
        }
    }
}

/// What an internal worker returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalOutcome {
    /// Task id.
    pub task_id: Uuid,
    /// Result payload.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Produced artifacts.
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    /// Set when execution failed.
    #[serde(default)]
    pub error: Option<TaskError>,
}

impl InternalOutcome {
    /// Successful outcome.
    pub fn produced(
        task_id: Uuid,
        result: Option<serde_json::Value>,
        artifacts: Vec<ArtifactRef>,
    ) -> Self {
        Self {
            task_id,
            result,
            artifacts,
            error: None,
        }
    }

    /// Failed outcome.
    pub fn failed(task_id: Uuid, error: TaskError) -> Self {
        Self {
            task_id,
            result: None,
            artifacts: Vec::new(),
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// External protocol
// ---------------------------------------------------------------------------

/// Lifecycle state as reported by an external agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalState {
    /// Received and acknowledged.
    Submitted,
    /// Being worked on.
    Working,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Withdrawn.
    Cancelled,
    /// Declined by the agent.
    Rejected,
}

impl ExternalState {
    /// Whether the external agent will report no further changes.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExternalState::Completed
                | ExternalState::Failed
                | ExternalState::Cancelled
                | ExternalState::Rejected
        )
    }
}

/// Task creation request of the external protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTaskRequest {
    /// Task id, unique per sender.
    pub id: String,
    /// Task type tag.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Opaque parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Priority.
    #[serde(default)]
    pub priority: Priority,
    /// Time budget in seconds.
    pub timeout: u64,
}

/// Status document of the external protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalStatus {
    /// Task id.
    pub id: String,
    /// Current state.
    pub state: ExternalState,
    /// Progress in `[0, 1]`, when reported.
    #[serde(default)]
    pub progress: Option<f64>,
    /// Free-form status message.
    #[serde(default)]
    pub message: Option<String>,
}

/// Artifact reference of the external protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalArtifact {
    /// Artifact id.
    pub id: String,
    /// Producing task.
    pub task_id: String,
    /// Artifact type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Storage location.
    pub location: String,
    /// Lowercase hex sha256 of the content.
    pub content_hash: String,
    /// Size in bytes.
    pub size: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Final result document of the external protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTaskResult {
    /// Task id.
    pub id: String,
    /// Terminal state.
    pub state: ExternalState,
    /// Result payload.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Error message, when failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Produced artifacts.
    #[serde(default)]
    pub artifacts: Vec<ExternalArtifact>,
}
