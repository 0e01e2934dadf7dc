use async_trait::async_trait;
use baton_core::{AgentDescriptor, ArtifactRef, BatonResult, Task};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A file produced by a worker. The dispatcher stores it in the artifact
/// store and keeps only the reference on the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// Artifact kind, e.g. `script` or `report`.
    pub kind: String,
    /// File name.
    pub name: String,
    /// Content.
    pub content: Vec<u8>,
}

impl OutputFile {
    /// Creates an output file.
    pub fn new(kind: impl Into<String>, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            content: content.into(),
        }
    }
}

/// What a worker hands back after executing a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkOutput {
    /// Structured result.
    pub result: Option<serde_json::Value>,
    /// Files to store as artifacts.
    pub files: Vec<OutputFile>,
    /// Artifacts the worker already stored elsewhere.
    pub artifacts: Vec<ArtifactRef>,
}

impl WorkOutput {
    /// Output carrying only a result.
    pub fn result(value: serde_json::Value) -> Self {
        Self {
            result: Some(value),
            ..Self::default()
        }
    }

    /// Adds a file.
    pub fn with_file(mut self, file: OutputFile) -> Self {
        self.files.push(file);
        self
    }
}

/// Self-reported worker condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Whether the worker can take new tasks.
    pub ready: bool,
    /// Tasks the worker is currently running.
    pub running: usize,
    /// Free-form detail.
    #[serde(default)]
    pub detail: Option<String>,
}

impl WorkerStatus {
    /// An idle, ready worker.
    pub fn ready() -> Self {
        Self {
            ready: true,
            running: 0,
            detail: None,
        }
    }
}

/// An agent that speaks the internal protocol.
///
/// The dispatcher calls `accept` first; only an accepted task is moved to
/// `in_progress` and handed to `execute`.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Identity, protocol and capabilities. Health is not the worker's to
    /// report and is ignored here.
    fn descriptor(&self) -> AgentDescriptor;

    /// Acknowledges or declines a task.
    async fn accept(&self, task: &Task) -> BatonResult<bool>;

    /// Runs an accepted task.
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> BatonResult<WorkOutput>;

    /// Current condition.
    async fn report_status(&self) -> BatonResult<WorkerStatus>;
}
