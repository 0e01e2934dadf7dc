use crate::planner::{
    Escalation, EscalationLog, EscalationResolution, NullPlanner, PlanningCollaborator, RevisedTask,
};
use crate::registry::{AgentRegistry, AgentSlot};
use crate::worker::{Worker, WorkOutput};
use baton_audit::{AuditDecision, AuditPipeline, AuditResult, AuditResultStore};
use baton_core::{
    AgentDescriptor, ArtifactRef, BatonError, BatonResult, FailureReason, Priority,
    ProtocolBinding, RetryPolicy, Task, TaskError, TaskState,
};
use baton_gateway::{GatewayOutcome, ProtocolGateway};
use baton_ledger::{SessionStore, TaskFilter, TaskLedger, TransitionPayload};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SESSION_APPEND_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Time-to-live per protocol. A task's deadline is fixed at creation as
/// `created_at + ttl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlConfig {
    /// TTL of tasks for internal agents, in seconds.
    #[serde(default = "default_internal_ttl")]
    pub internal_secs: u64,
    /// TTL of tasks for external agents, in seconds.
    #[serde(default = "default_external_ttl")]
    pub external_secs: u64,
}

fn default_internal_ttl() -> u64 {
    300
}
fn default_external_ttl() -> u64 {
    1800
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            internal_secs: default_internal_ttl(),
            external_secs: default_external_ttl(),
        }
    }
}

impl TtlConfig {
    /// TTL for tasks bound to `protocol`.
    pub fn for_protocol(&self, protocol: ProtocolBinding) -> chrono::Duration {
        let secs = match protocol {
            ProtocolBinding::Internal => self.internal_secs,
            ProtocolBinding::External => self.external_secs,
        };
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }
}

/// Dispatcher tuning (`[dispatcher]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Delay between dispatch passes of the run loop.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Time an internal worker gets to accept a task.
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    /// Time a task gets to produce its output, gateway round trips included.
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    /// Tasks dispatched concurrently by the run loop.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Resubmissions allowed per original task after NO-GO audits.
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    /// Retry policy for transient failures while handing a task over.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-protocol TTL.
    #[serde(default)]
    pub ttl: TtlConfig,
}

fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_accept_timeout_ms() -> u64 {
    5000
}
fn default_execution_timeout_ms() -> u64 {
    120_000
}
fn default_max_in_flight() -> usize {
    32
}
fn default_max_replans() -> u32 {
    2
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            accept_timeout_ms: default_accept_timeout_ms(),
            execution_timeout_ms: default_execution_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            max_replans: default_max_replans(),
            retry: RetryPolicy::default(),
            ttl: TtlConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

/// A unit of work submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Requesting agent.
    pub from_agent: String,
    /// Target agent. When absent, an agent is selected by capabilities.
    #[serde(default)]
    pub to_agent: Option<String>,
    /// Task type tag.
    pub task_type: String,
    /// Opaque parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Priority.
    #[serde(default)]
    pub priority: Priority,
    /// Capability tags the target must declare.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Restricts the target to one protocol.
    #[serde(default)]
    pub protocol: Option<ProtocolBinding>,
    /// Existing session to continue; a new one is opened when absent.
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

impl SubmitRequest {
    /// Request for a named target.
    pub fn to(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            from_agent: from_agent.into(),
            to_agent: Some(to_agent.into()),
            task_type: task_type.into(),
            parameters: serde_json::Value::Null,
            priority: Priority::default(),
            capabilities: BTreeSet::new(),
            protocol: None,
            session_id: None,
        }
    }

    /// Sets the parameters.
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// How one dispatch of a task ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Task dispatched.
    pub task_id: Uuid,
    /// State the task was left in. `in_progress` means a CAUTION result is
    /// waiting for a decision.
    pub state: TaskState,
    /// Audit of the produced output, if it got that far.
    pub audit: Option<AuditResult>,
    /// Escalation raised for a NO-GO.
    pub escalation: Option<Uuid>,
    /// Task resubmitted by the planner.
    pub resubmitted: Option<Uuid>,
}

impl RunReport {
    fn ended(task_id: Uuid, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            audit: None,
            escalation: None,
            resubmitted: None,
        }
    }
}

/// Output waiting for audit or decision.
#[derive(Debug, Clone, Default, PartialEq)]
struct Produced {
    result: Option<serde_json::Value>,
    artifacts: Vec<ArtifactRef>,
}

enum Step {
    Produced(Produced),
    Ended(TaskState),
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherMetricsSnapshot {
    /// Tasks submitted.
    pub submitted: u64,
    /// Dispatches started.
    pub dispatched: u64,
    /// Tasks completed after a GO or an accepted CAUTION.
    pub completed: u64,
    /// Tasks failed during dispatch or audit.
    pub failed: u64,
    /// Tasks cancelled.
    pub cancelled: u64,
    /// CAUTION results waiting for a decision.
    pub awaiting_decision: u64,
    /// Escalations raised.
    pub escalations: u64,
    /// Tasks resubmitted from escalations.
    pub resubmitted: u64,
}

#[derive(Default)]
struct DispatcherMetrics {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    escalations: AtomicU64,
    resubmitted: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Marks a task as being dispatched; removed on drop.
struct InFlight {
    map: Arc<DashMap<Uuid, ()>>,
    id: Uuid,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.map.remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Creates tasks, routes them to workers or through the gateway, and gates
/// completion on the audit pipeline.
pub struct Dispatcher {
    ledger: Arc<TaskLedger>,
    sessions: Arc<dyn SessionStore>,
    registry: Arc<AgentRegistry>,
    gateway: Arc<ProtocolGateway>,
    pipeline: Arc<AuditPipeline>,
    audits: Arc<AuditResultStore>,
    planner: Arc<dyn PlanningCollaborator>,
    escalations: Arc<EscalationLog>,
    config: DispatcherConfig,
    in_flight: Arc<DashMap<Uuid, ()>>,
    awaiting: DashMap<Uuid, Produced>,
    slots: Arc<Semaphore>,
    metrics: DispatcherMetrics,
}

impl Dispatcher {
    /// Creates a dispatcher with a [`NullPlanner`].
    pub fn new(
        ledger: Arc<TaskLedger>,
        sessions: Arc<dyn SessionStore>,
        registry: Arc<AgentRegistry>,
        gateway: Arc<ProtocolGateway>,
        pipeline: Arc<AuditPipeline>,
        config: DispatcherConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            ledger,
            sessions,
            registry,
            gateway,
            pipeline,
            audits: Arc::new(AuditResultStore::new()),
            planner: Arc::new(NullPlanner),
            escalations: Arc::new(EscalationLog::new()),
            config,
            in_flight: Arc::new(DashMap::new()),
            awaiting: DashMap::new(),
            slots,
            metrics: DispatcherMetrics::default(),
        }
    }

    /// Uses `planner` for NO-GO escalations.
    pub fn with_planner(mut self, planner: Arc<dyn PlanningCollaborator>) -> Self {
        self.planner = planner;
        self
    }

    /// Task ledger.
    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    /// Session store.
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Protocol gateway.
    pub fn gateway(&self) -> &Arc<ProtocolGateway> {
        &self.gateway
    }

    /// Audit pipeline.
    pub fn pipeline(&self) -> &Arc<AuditPipeline> {
        &self.pipeline
    }

    /// Audit history.
    pub fn audits(&self) -> &Arc<AuditResultStore> {
        &self.audits
    }

    /// Escalation log.
    pub fn escalations(&self) -> &Arc<EscalationLog> {
        &self.escalations
    }

    /// Configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Counters.
    pub fn metrics(&self) -> DispatcherMetricsSnapshot {
        self.prune_awaiting();
        let m = &self.metrics;
        DispatcherMetricsSnapshot {
            submitted: m.submitted.load(Ordering::Relaxed),
            dispatched: m.dispatched.load(Ordering::Relaxed),
            completed: m.completed.load(Ordering::Relaxed),
            failed: m.failed.load(Ordering::Relaxed),
            cancelled: m.cancelled.load(Ordering::Relaxed),
            awaiting_decision: self.awaiting.len() as u64,
            escalations: m.escalations.load(Ordering::Relaxed),
            resubmitted: m.resubmitted.load(Ordering::Relaxed),
        }
    }

    /// Drops held CAUTION payloads whose task left `in_progress` without a
    /// decision, e.g. because the reaper expired it.
    fn prune_awaiting(&self) {
        self.awaiting.retain(|task_id, _| {
            let waiting = self
                .ledger
                .get(*task_id)
                .map_or(false, |task| task.state == TaskState::InProgress);
            if !waiting {
                debug!(task_id = %task_id, "Dispatcher: dropping undecided CAUTION result");
            }
            waiting
        });
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Creates a pending task for the requested or selected agent.
    pub async fn submit(&self, request: SubmitRequest) -> BatonResult<Uuid> {
        if request.from_agent.trim().is_empty() || request.task_type.trim().is_empty() {
            return Err(BatonError::Protocol(
                "from_agent and task_type must not be empty".into(),
            ));
        }
        let descriptor = match &request.to_agent {
            Some(id) => {
                let descriptor = self.registry.resolve(id, request.protocol)?;
                if !descriptor.has_capabilities(&request.capabilities) {
                    return Err(BatonError::NoAgentAvailable(format!(
                        "agent '{id}' lacks capabilities {:?}",
                        request.capabilities
                    )));
                }
                descriptor
            }
            None => self.registry.select(request.protocol, &request.capabilities)?,
        };
        if descriptor.protocol == ProtocolBinding::External && !self.gateway.has_agent(&descriptor.id) {
            return Err(BatonError::NoAgentAvailable(format!(
                "external agent '{}' has no gateway client",
                descriptor.id
            )));
        }

        let session_id = match request.session_id {
            Some(id) => self.sessions.latest(id).await?.session_id,
            None => {
                self.sessions
                    .open(ProtocolBinding::Internal, None)
                    .await?
                    .session_id
            }
        };
        let task = Task::new(
            session_id,
            request.from_agent,
            descriptor.id.clone(),
            request.task_type,
            descriptor.protocol,
            self.config.ttl.for_protocol(descriptor.protocol),
        )
        .with_parameters(request.parameters)
        .with_priority(request.priority);
        let id = self.create_in_session(task).await?;
        bump(&self.metrics.submitted);
        Ok(id)
    }

    async fn create_in_session(&self, task: Task) -> BatonResult<Uuid> {
        let (task_id, session_id) = (task.id, task.session_id);
        let mut last_err = None;
        for _ in 0..SESSION_APPEND_ATTEMPTS {
            let mut next = self.sessions.latest(session_id).await?.next();
            next.task_ids.push(task_id);
            match self.sessions.append(next).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e @ BatonError::SessionConflict(_)) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        if let Some(e) = last_err {
            return Err(e);
        }

        info!(
            task_id = %task_id,
            session_id = %session_id,
            to_agent = %task.to_agent,
            protocol = %task.protocol,
            priority = %task.priority,
            deadline = %task.deadline,
            "Dispatcher: task submitted"
        );
        self.ledger.create(task)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn enter(&self, task_id: Uuid) -> BatonResult<InFlight> {
        if self.in_flight.insert(task_id, ()).is_some() {
            return Err(BatonError::Protocol(format!(
                "task {task_id} is already being dispatched"
            )));
        }
        Ok(InFlight {
            map: self.in_flight.clone(),
            id: task_id,
        })
    }

    /// Dispatches one pending task and waits until it completes, fails, or
    /// stops at a CAUTION result.
    ///
    /// A `Timeout` while waiting for an internal worker to accept leaves the
    /// task pending; it is retried on a later pass or expired by the reaper.
    pub async fn run_task(&self, task_id: Uuid, cancel: &CancellationToken) -> BatonResult<RunReport> {
        let _guard = self.enter(task_id)?;
        let (task, descriptor, slot) = self.claim(task_id)?;
        self.run_claimed(task, descriptor, slot, cancel).await
    }

    /// Loads a pending task and claims a slot on its agent.
    fn claim(&self, task_id: Uuid) -> BatonResult<(Arc<Task>, AgentDescriptor, AgentSlot)> {
        let task = self.ledger.get(task_id)?;
        if task.state != TaskState::Pending {
            return Err(BatonError::InvalidTransition {
                task_id,
                from: TaskState::Pending,
                to: TaskState::Accepted,
                current: task.state,
            });
        }
        let descriptor = self
            .registry
            .descriptor(task.protocol, &task.to_agent)
            .ok_or_else(|| {
                BatonError::NoAgentAvailable(format!("agent '{}' is not registered", task.to_agent))
            })?;
        let slot = self
            .registry
            .claim(task.protocol, &task.to_agent)
            .ok_or_else(|| {
                BatonError::NoAgentAvailable(format!(
                    "agent '{}' is at its concurrency limit",
                    task.to_agent
                ))
            })?;
        Ok((task, descriptor, slot))
    }

    async fn run_claimed(
        &self,
        task: Arc<Task>,
        descriptor: AgentDescriptor,
        _slot: AgentSlot,
        cancel: &CancellationToken,
    ) -> BatonResult<RunReport> {
        let task_id = task.id;
        bump(&self.metrics.dispatched);
        debug!(task_id = %task_id, agent = %descriptor.id, protocol = %task.protocol, "Dispatcher: dispatching");

        let step = match task.protocol {
            ProtocolBinding::Internal => self.run_internal(&task, &descriptor, cancel).await?,
            ProtocolBinding::External => self.run_external(&task, &descriptor, cancel).await?,
        };
        match step {
            Step::Ended(state) => {
                match state {
                    TaskState::Failed => bump(&self.metrics.failed),
                    TaskState::Cancelled => bump(&self.metrics.cancelled),
                    _ => {}
                }
                Ok(RunReport::ended(task_id, state))
            }
            Step::Produced(produced) => self.audit_and_settle(task_id, produced, cancel).await,
        }
    }

    async fn run_internal(
        &self,
        task: &Arc<Task>,
        descriptor: &AgentDescriptor,
        cancel: &CancellationToken,
    ) -> BatonResult<Step> {
        let worker = self.registry.worker(&task.to_agent).ok_or_else(|| {
            BatonError::NoAgentAvailable(format!("no worker behind agent '{}'", task.to_agent))
        })?;
        let accept_timeout = Duration::from_millis(self.config.accept_timeout_ms);

        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BatonError::Cancelled(format!("dispatch of task {}", task.id)));
            }
            res = self.config.retry.run("accept", |_| accept_once(&worker, task, accept_timeout)) => res,
        };
        match accepted {
            Ok(true) => {
                self.registry.observe(descriptor, true);
                self.ledger.transition(
                    task.id,
                    TaskState::Pending,
                    TaskState::Accepted,
                    TransitionPayload::none(),
                )?;
            }
            Ok(false) => {
                let error = TaskError::new(
                    FailureReason::Rejected,
                    format!("agent '{}' declined the task", task.to_agent),
                );
                self.ledger.force_fail(task.id, TaskState::Pending, error)?;
                return Ok(Step::Ended(TaskState::Failed));
            }
            Err(e @ BatonError::Timeout(_)) => {
                self.registry.observe(descriptor, false);
                warn!(task_id = %task.id, agent = %task.to_agent, "Dispatcher: no acknowledgement, task left pending");
                return Err(e);
            }
            Err(e) => {
                self.registry.observe(descriptor, false);
                let error = TaskError::new(
                    FailureReason::Rejected,
                    format!("agent '{}' could not accept the task: {e}", task.to_agent),
                )
                .with_details(serde_json::json!({"error_kind": e.kind()}));
                self.ledger.force_fail(task.id, TaskState::Pending, error)?;
                return Ok(Step::Ended(TaskState::Failed));
            }
        }

        let running = self.ledger.transition(
            task.id,
            TaskState::Accepted,
            TaskState::InProgress,
            TransitionPayload::none(),
        )?;
        let timeout = Duration::from_millis(self.config.execution_timeout_ms);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BatonError::Cancelled(format!("execution of task {}", task.id)));
            }
            res = tokio::time::timeout(timeout, worker.execute(&running, cancel)) => res,
        };

        match outcome {
            Ok(Ok(output)) => {
                self.registry.observe(descriptor, true);
                match self.store_output(task.id, output).await {
                    Ok(produced) => Ok(Step::Produced(produced)),
                    Err(e) => {
                        self.fail_running(
                            task.id,
                            TaskError::new(
                                FailureReason::ExecutionError,
                                format!("output could not be stored: {e}"),
                            ),
                            Produced::default(),
                        )?;
                        Ok(Step::Ended(TaskState::Failed))
                    }
                }
            }
            Ok(Err(e)) => {
                self.registry.observe(descriptor, false);
                let error = TaskError::new(FailureReason::ExecutionError, e.to_string())
                    .with_details(serde_json::json!({"error_kind": e.kind()}));
                self.fail_running(task.id, error, Produced::default())?;
                Ok(Step::Ended(TaskState::Failed))
            }
            Err(_) => {
                self.registry.observe(descriptor, false);
                let error = TaskError::new(
                    FailureReason::Timeout,
                    format!("execution exceeded {}ms", self.config.execution_timeout_ms),
                );
                self.fail_running(task.id, error, Produced::default())?;
                Ok(Step::Ended(TaskState::Failed))
            }
        }
    }

    async fn run_external(
        &self,
        task: &Arc<Task>,
        descriptor: &AgentDescriptor,
        cancel: &CancellationToken,
    ) -> BatonResult<Step> {
        let timeout = Duration::from_millis(self.config.execution_timeout_ms);
        match self.gateway.dispatch_external(task.id, timeout, cancel).await {
            Ok(GatewayOutcome::Produced { result, artifacts }) => {
                self.registry.observe(descriptor, true);
                Ok(Step::Produced(Produced { result, artifacts }))
            }
            Ok(GatewayOutcome::Failed(error)) => {
                self.registry.observe(descriptor, false);
                debug!(task_id = %task.id, reason = %error.reason, "Dispatcher: external task failed");
                Ok(Step::Ended(TaskState::Failed))
            }
            Ok(GatewayOutcome::Cancelled) => Ok(Step::Ended(TaskState::Cancelled)),
            Err(e) => {
                if e.is_transient() || matches!(e, BatonError::GatewayUnavailable(_)) {
                    self.registry.observe(descriptor, false);
                }
                if self.ledger.get(task.id).is_ok_and(|t| t.state == TaskState::Failed) {
                    bump(&self.metrics.failed);
                }
                Err(e)
            }
        }
    }

    async fn store_output(&self, task_id: Uuid, output: WorkOutput) -> BatonResult<Produced> {
        let mut artifacts = Vec::with_capacity(output.files.len() + output.artifacts.len());
        for file in &output.files {
            artifacts.push(
                self.pipeline
                    .store()
                    .put(task_id, &file.kind, &file.name, &file.content)
                    .await?,
            );
        }
        artifacts.extend(output.artifacts);
        Ok(Produced {
            result: output.result,
            artifacts,
        })
    }

    fn fail_running(&self, task_id: Uuid, error: TaskError, produced: Produced) -> BatonResult<Arc<Task>> {
        self.ledger.transition(
            task_id,
            TaskState::InProgress,
            TaskState::Failed,
            TransitionPayload {
                result: produced.result,
                error: Some(error),
                artifacts: produced.artifacts,
                external_id: None,
            },
        )
    }

    fn complete(&self, task_id: Uuid, produced: Produced) -> BatonResult<Arc<Task>> {
        let done = self.ledger.transition(
            task_id,
            TaskState::InProgress,
            TaskState::Completed,
            TransitionPayload::produced(produced.result, produced.artifacts),
        )?;
        bump(&self.metrics.completed);
        Ok(done)
    }

    // -----------------------------------------------------------------------
    // Audit gate
    // -----------------------------------------------------------------------

    async fn audit_and_settle(
        &self,
        task_id: Uuid,
        produced: Produced,
        cancel: &CancellationToken,
    ) -> BatonResult<RunReport> {
        let current = self.ledger.get(task_id)?;
        let mut view = (*current).clone();
        if produced.result.is_some() {
            view.result = produced.result.clone();
        }
        view.artifacts.extend(produced.artifacts.iter().cloned());

        let attempt = self.audits.next_attempt(task_id);
        let audit = match self.pipeline.audit(&view, attempt, cancel).await {
            Ok(audit) => audit,
            Err(e @ BatonError::Cancelled(_)) => return Err(e),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Dispatcher: audit could not run");
                let error = TaskError::new(
                    FailureReason::ExecutionError,
                    format!("audit could not run: {e}"),
                )
                .with_details(serde_json::json!({"error_kind": e.kind()}));
                self.fail_running(task_id, error, produced)?;
                bump(&self.metrics.failed);
                return Ok(RunReport::ended(task_id, TaskState::Failed));
            }
        };

        match audit.decision {
            AuditDecision::Go => {
                self.audits.record(audit.clone())?;
                self.complete(task_id, produced)?;
                info!(task_id = %task_id, audit_id = %audit.id, "Dispatcher: task completed");
                Ok(RunReport {
                    task_id,
                    state: TaskState::Completed,
                    audit: Some(audit),
                    escalation: None,
                    resubmitted: None,
                })
            }
            AuditDecision::Caution => {
                self.audits.record(audit.clone())?;
                self.awaiting.insert(task_id, produced);
                info!(task_id = %task_id, audit_id = %audit.id, "Dispatcher: CAUTION result awaiting decision");
                Ok(RunReport {
                    task_id,
                    state: TaskState::InProgress,
                    audit: Some(audit),
                    escalation: None,
                    resubmitted: None,
                })
            }
            AuditDecision::NoGo => self.escalate(view, audit, produced).await,
        }
    }

    async fn escalate(
        &self,
        view: Task,
        mut audit: AuditResult,
        produced: Produced,
    ) -> BatonResult<RunReport> {
        let escalation = Escalation::for_audit(&view, &audit, &view.artifacts);
        audit.escalation = Some(escalation.id);
        self.audits.record(audit.clone())?;

        let stage = audit
            .failing_stage()
            .map_or_else(|| "unknown".to_string(), |s| s.to_string());
        let first = audit
            .findings
            .first()
            .map(|f| format!(": {} ({})", f.message, f.rule))
            .unwrap_or_default();
        let error = TaskError::new(
            FailureReason::AuditNoGo,
            format!("audit NO-GO at stage {stage}{first}"),
        )
        .with_details(serde_json::json!({
            "audit_id": audit.id,
            "failing_stage": audit.failing_stage(),
            "escalation_id": escalation.id,
            "findings": audit.findings.len(),
        }));
        self.fail_running(view.id, error, produced)?;
        bump(&self.metrics.failed);

        self.escalations.append(escalation.clone());
        bump(&self.metrics.escalations);
        let resubmitted = self.replan(&view, &escalation).await;

        Ok(RunReport {
            task_id: view.id,
            state: TaskState::Failed,
            audit: Some(audit),
            escalation: Some(escalation.id),
            resubmitted,
        })
    }

    async fn replan(&self, task: &Task, escalation: &Escalation) -> Option<Uuid> {
        if task.attempt >= self.config.max_replans {
            info!(task_id = %task.id, attempt = task.attempt, "Dispatcher: replan ceiling reached");
            self.escalations
                .resolve(escalation.id, EscalationResolution::Exhausted);
            return None;
        }
        let resolution = match self.planner.revise(escalation, task).await {
            Ok(Some(revision)) => match self.resubmit(task, revision).await {
                Ok(id) => {
                    bump(&self.metrics.resubmitted);
                    info!(task_id = %task.id, resubmitted = %id, "Dispatcher: revised task resubmitted");
                    EscalationResolution::Resubmitted { task_id: id }
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Dispatcher: resubmission failed");
                    EscalationResolution::PlanningFailed {
                        message: e.to_string(),
                    }
                }
            },
            Ok(None) => EscalationResolution::Declined,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Dispatcher: planner failed");
                EscalationResolution::PlanningFailed {
                    message: e.to_string(),
                }
            }
        };
        let resubmitted = match &resolution {
            EscalationResolution::Resubmitted { task_id } => Some(*task_id),
            _ => None,
        };
        self.escalations.resolve(escalation.id, resolution);
        resubmitted
    }

    async fn resubmit(&self, task: &Task, revision: RevisedTask) -> BatonResult<Uuid> {
        let to_agent = revision.to_agent.unwrap_or_else(|| task.to_agent.clone());
        let descriptor = self.registry.resolve(&to_agent, None)?;
        let session = self
            .sessions
            .open(ProtocolBinding::Internal, Some(task.session_id))
            .await?;
        let parameters = if revision.parameters.is_null() {
            task.parameters.clone()
        } else {
            revision.parameters
        };
        let child = Task::new(
            session.session_id,
            task.from_agent.clone(),
            descriptor.id,
            revision.task_type.unwrap_or_else(|| task.task_type.clone()),
            descriptor.protocol,
            self.config.ttl.for_protocol(descriptor.protocol),
        )
        .with_parameters(parameters)
        .with_priority(revision.priority.unwrap_or(task.priority))
        .with_parent(task.id, task.attempt + 1);
        let id = self.create_in_session(child).await?;
        bump(&self.metrics.submitted);
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// One dispatch pass: starts pending tasks, highest priority first and
    /// oldest first within a priority, while run-loop slots and agent
    /// concurrency allow. Returns the number started.
    pub fn dispatch_pending(self: &Arc<Self>, cancel: &CancellationToken) -> usize {
        self.prune_awaiting();
        let mut pending = self
            .ledger
            .query(&TaskFilter::in_states([TaskState::Pending]));
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut started = 0;
        for task in pending {
            if self.in_flight.contains_key(&task.id) {
                continue;
            }
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            let Ok(guard) = self.enter(task.id) else {
                continue;
            };
            let Ok((task, descriptor, slot)) = self.claim(task.id) else {
                continue;
            };
            let this = Arc::clone(self);
            let cancel = cancel.clone();
            let task_id = task.id;
            tokio::spawn(async move {
                let _permit = permit;
                let _guard = guard;
                match this.run_claimed(task, descriptor, slot, &cancel).await {
                    Ok(report) => debug!(task_id = %task_id, state = %report.state, "Dispatcher: dispatch finished"),
                    Err(e) => debug!(task_id = %task_id, error = %e, "Dispatcher: dispatch ended with error"),
                }
            });
            started += 1;
        }
        if started > 0 {
            debug!(started, "Dispatcher: pass complete");
        }
        started
    }

    /// Runs dispatch passes until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_in_flight = self.config.max_in_flight,
            "Dispatcher: loop started"
        );
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.dispatch_pending(&cancel);
                }
            }
        }
        info!("Dispatcher: loop stopped");
    }

    // -----------------------------------------------------------------------
    // Decisions and cancellation
    // -----------------------------------------------------------------------

    /// Accepts or rejects the CAUTION result a task is waiting on.
    pub fn resolve_caution(&self, task_id: Uuid, accept: bool, reviewer: &str) -> BatonResult<Arc<Task>> {
        let task = self.ledger.get(task_id)?;
        let audit = self
            .audits
            .latest(task_id)
            .filter(|a| a.decision == AuditDecision::Caution)
            .ok_or_else(|| {
                BatonError::Protocol(format!("task {task_id} has no CAUTION result to decide"))
            })?;
        let target = if accept {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        if task.state != TaskState::InProgress {
            return Err(BatonError::InvalidTransition {
                task_id,
                from: TaskState::InProgress,
                to: target,
                current: task.state,
            });
        }

        self.audits.decide_caution(audit.id, accept, reviewer)?;
        let produced = self
            .awaiting
            .remove(&task_id)
            .map(|(_, p)| p)
            .unwrap_or_default();
        if accept {
            info!(task_id = %task_id, reviewer, "Dispatcher: CAUTION accepted");
            self.complete(task_id, produced)
        } else {
            info!(task_id = %task_id, reviewer, "Dispatcher: CAUTION rejected");
            let error = TaskError::new(
                FailureReason::CautionRejected,
                format!("CAUTION result rejected by {reviewer}"),
            )
            .with_details(serde_json::json!({"audit_id": audit.id, "reviewer": reviewer}));
            let failed = self.fail_running(task_id, error, produced)?;
            bump(&self.metrics.failed);
            Ok(failed)
        }
    }

    /// Cancels a task that has not started executing.
    pub async fn cancel(&self, task_id: Uuid) -> BatonResult<Arc<Task>> {
        let task = self.ledger.get(task_id)?;
        if !task.state.is_cancellable() {
            return Err(BatonError::InvalidTransition {
                task_id,
                from: task.state,
                to: TaskState::Cancelled,
                current: task.state,
            });
        }
        if task.protocol == ProtocolBinding::External && task.external_id.is_some() {
            if let Err(e) = self.gateway.cancel_remote(task_id).await {
                warn!(task_id = %task_id, error = %e, "Dispatcher: remote cancel failed");
            }
        }
        let cancelled = self.ledger.transition(
            task_id,
            task.state,
            TaskState::Cancelled,
            TransitionPayload::none(),
        )?;
        bump(&self.metrics.cancelled);
        info!(task_id = %task_id, "Dispatcher: task cancelled");
        Ok(cancelled)
    }
}

async fn accept_once(
    worker: &Arc<dyn Worker>,
    task: &Task,
    timeout: Duration,
) -> BatonResult<bool> {
    tokio::time::timeout(timeout, worker.accept(task))
        .await
        .map_err(|_| {
            BatonError::Timeout(format!(
                "agent '{}' did not acknowledge task {}",
                task.to_agent, task.id
            ))
        })?
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: DispatcherConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DispatcherConfig::default());
        assert_eq!(config.ttl.for_protocol(ProtocolBinding::Internal).num_seconds(), 300);
        assert_eq!(config.ttl.for_protocol(ProtocolBinding::External).num_seconds(), 1800);
    }

    #[test]
    fn test_submit_request_defaults() {
        let request: SubmitRequest = serde_json::from_str(
            r#"{"from_agent": "coordinator", "to_agent": "coder", "task_type": "implement"}"#,
        )
        .unwrap();
        assert_eq!(request, SubmitRequest::to("coordinator", "coder", "implement"));
        assert_eq!(request.priority, Priority::Medium);
    }
}
