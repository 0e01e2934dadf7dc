use crate::task::{ArtifactRef, Priority, Task, TaskError, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The task record as exposed over the wire.
///
/// Field names are stable; internal bookkeeping such as `parent_task` or the
/// protocol binding is left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task id.
    pub id: Uuid,
    /// Originating agent.
    pub from_agent: String,
    /// Target agent.
    pub to_agent: String,
    /// Task type tag.
    pub task_type: String,
    /// Priority.
    pub priority: Priority,
    /// Parameters as submitted.
    pub parameters: serde_json::Value,
    /// Current state.
    pub state: TaskState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Fixed deadline.
    pub deadline: DateTime<Utc>,
    /// Result payload, when produced.
    pub result: Option<serde_json::Value>,
    /// Error payload, when failed.
    pub error: Option<TaskError>,
    /// Artifact references.
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            from_agent: task.from_agent.clone(),
            to_agent: task.to_agent.clone(),
            task_type: task.task_type.clone(),
            priority: task.priority,
            parameters: task.parameters.clone(),
            state: task.state,
            created_at: task.created_at,
            deadline: task.deadline,
            result: task.result.clone(),
            error: task.error.clone(),
            artifacts: task.artifacts.clone(),
        }
    }
}
