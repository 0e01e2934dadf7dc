use crate::task::TaskState;
use uuid::Uuid;

/// Top-level error type for the Baton orchestration core.
///
/// The first five variants are the failure taxonomy callers are expected to
/// branch on; the rest describe lookup, protocol and infrastructure problems.
#[derive(Debug, thiserror::Error)]
pub enum BatonError {
    /// The ledger rejected a state change that is not in the lifecycle table,
    /// or the caller's view of the current state was stale.
    #[error("Invalid transition for task {task_id}: {from} -> {to} (current state: {current})")]
    InvalidTransition {
        /// Task whose transition was rejected.
        task_id: Uuid,
        /// State the caller believed the task was in.
        from: TaskState,
        /// Requested target state.
        to: TaskState,
        /// State the task was actually in.
        current: TaskState,
    },

    /// The destination protocol stayed unreachable after the retry ceiling.
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// A governed endpoint's queue is full.
    #[error("Throttled: endpoint '{endpoint}' queue is full")]
    Throttled {
        /// Endpoint that rejected the request.
        endpoint: String,
    },

    /// Crash, timeout or resource kill inside the audit sandbox.
    #[error("Sandbox fault: {0}")]
    SandboxFault(String),

    /// A task was force-failed by the zombie reaper.
    #[error("Task {0} expired")]
    Expired(Uuid),

    /// No task with the given id exists in the ledger.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// No session with the given id exists.
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    /// No audit result with the given id exists.
    #[error("Audit not found: {0}")]
    AuditNotFound(Uuid),

    /// A session version was appended out of order.
    #[error("Session conflict: {0}")]
    SessionConflict(String),

    /// The governor has no pool configured under this name.
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// No registered worker can take the task.
    #[error("No agent available: {0}")]
    NoAgentAvailable(String),

    /// A caller-supplied timeout elapsed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the operation.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A payload did not match the expected protocol schema.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Artifact content did not match its recorded hash.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Invalid or inconsistent configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A worker agent failed while executing a task.
    #[error("Agent error: {0}")]
    Agent(String),

    /// The planning collaborator could not process an escalation.
    #[error("Planning error: {0}")]
    Planning(String),

    /// An outbound HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`BatonError`].
pub type BatonResult<T> = Result<T, BatonError>;

impl BatonError {
    /// Whether the failure is transient and may succeed on a bounded retry.
    ///
    /// Structural failures (invalid transitions, sandbox faults, protocol and
    /// integrity errors) are never retried automatically.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BatonError::GatewayUnavailable(_)
                | BatonError::Throttled { .. }
                | BatonError::Timeout(_)
                | BatonError::Http(_)
        )
    }

    /// Short machine-readable kind, used in API error bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BatonError::InvalidTransition { .. } => "invalid_transition",
            BatonError::GatewayUnavailable(_) => "gateway_unavailable",
            BatonError::Throttled { .. } => "throttled",
            BatonError::SandboxFault(_) => "sandbox_fault",
            BatonError::Expired(_) => "expired",
            BatonError::TaskNotFound(_) => "task_not_found",
            BatonError::SessionNotFound(_) => "session_not_found",
            BatonError::AuditNotFound(_) => "audit_not_found",
            BatonError::SessionConflict(_) => "session_conflict",
            BatonError::UnknownEndpoint(_) => "unknown_endpoint",
            BatonError::NoAgentAvailable(_) => "no_agent_available",
            BatonError::Timeout(_) => "timeout",
            BatonError::Cancelled(_) => "cancelled",
            BatonError::Protocol(_) => "protocol",
            BatonError::Integrity(_) => "integrity",
            BatonError::Config(_) => "config",
            BatonError::Agent(_) => "agent",
            BatonError::Planning(_) => "planning",
            BatonError::Http(_) => "http",
            BatonError::Json(_) => "json",
            BatonError::Io(_) => "io",
        }
    }
}
