use crate::client::ExternalAgentClient;
use crate::metrics::{GatewayMetrics, GatewayMetricsSnapshot};
use crate::schema::{
    ExternalState, ExternalStatus, ExternalTaskRequest, ExternalTaskResult, InternalEnvelope,
    InternalOutcome,
};
use crate::translate;
use baton_core::{
    ArtifactRef, BatonError, BatonResult, FailureReason, ProtocolBinding, RetryPolicy,
    SessionVersion, Task, TaskError, TaskState, TranslationDirection, TranslationRecord,
};
use baton_governor::ConnectionGovernor;
use baton_ledger::{SessionStore, TaskLedger, TransitionPayload};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SESSION_APPEND_ATTEMPTS: usize = 3;

/// Gateway tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Delay between status polls of an external task.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timeout of a single remote call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retry policy for remote calls.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

/// What came back from the external side of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayOutcome {
    /// The external agent finished. The task is left `in_progress` for audit.
    Produced {
        /// Result payload.
        result: Option<serde_json::Value>,
        /// Artifact references, hashes preserved.
        artifacts: Vec<ArtifactRef>,
    },
    /// The external agent failed or rejected the task. Already applied to
    /// the ledger.
    Failed(TaskError),
    /// The external agent cancelled the task. Already applied to the ledger.
    Cancelled,
}

#[derive(Clone)]
struct RemoteAgent {
    client: Arc<dyn ExternalAgentClient>,
    endpoint: Option<String>,
}

/// Bridges internal dispatch and the external agent protocol.
///
/// Every handoff writes a new session version and exactly one translation
/// record per task and direction. The gateway moves tasks through
/// `accepted` and `in_progress` and applies failures reported by the far
/// side, but never completes a task.
pub struct ProtocolGateway {
    ledger: Arc<TaskLedger>,
    sessions: Arc<dyn SessionStore>,
    governor: Arc<ConnectionGovernor>,
    agents: RwLock<HashMap<String, RemoteAgent>>,
    inbound: tokio::sync::Mutex<HashMap<String, Uuid>>,
    config: GatewayConfig,
    metrics: GatewayMetrics,
}

impl ProtocolGateway {
    /// Creates a gateway.
    pub fn new(
        ledger: Arc<TaskLedger>,
        sessions: Arc<dyn SessionStore>,
        governor: Arc<ConnectionGovernor>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            ledger,
            sessions,
            governor,
            agents: RwLock::new(HashMap::new()),
            inbound: tokio::sync::Mutex::new(HashMap::new()),
            config,
            metrics: GatewayMetrics::default(),
        }
    }

    /// Registers the client for an external agent. When `endpoint` is set,
    /// every call to the agent goes through that governed endpoint.
    pub fn register_agent(
        &self,
        agent_id: impl Into<String>,
        client: Arc<dyn ExternalAgentClient>,
        endpoint: Option<String>,
    ) -> BatonResult<()> {
        let agent_id = agent_id.into();
        if let Some(endpoint) = &endpoint {
            if !self.governor.has_endpoint(endpoint) {
                return Err(BatonError::UnknownEndpoint(endpoint.clone()));
            }
        }
        info!(agent = %agent_id, endpoint = ?endpoint, "Gateway: external agent registered");
        self.agents
            .write()
            .insert(agent_id, RemoteAgent { client, endpoint });
        Ok(())
    }

    /// Whether an external agent with this id is registered.
    pub fn has_agent(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    fn agent(&self, agent_id: &str) -> BatonResult<RemoteAgent> {
        self.agents
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| BatonError::NoAgentAvailable(format!("external agent '{agent_id}'")))
    }

    /// Gateway metrics.
    pub fn metrics(&self) -> GatewayMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runs one remote call with the unified retry policy, through the
    /// agent's governed endpoint when it has one.
    async fn remote<T, F, Fut>(&self, agent: &RemoteAgent, label: &str, op: F) -> BatonResult<T>
    where
        F: Fn(Arc<dyn ExternalAgentClient>) -> Fut,
        Fut: Future<Output = BatonResult<T>>,
    {
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        self.config
            .retry
            .run(label, |attempt| {
                if attempt > 0 {
                    self.metrics.record_retry();
                }
                let fut = op(agent.client.clone());
                async move {
                    match &agent.endpoint {
                        Some(endpoint) => self.governor.call(endpoint, timeout, || fut).await,
                        None => tokio::time::timeout(timeout, fut)
                            .await
                            .map_err(|_| BatonError::Timeout(label.to_string()))?,
                    }
                }
            })
            .await
    }

    async fn append_session<F>(&self, session_id: Uuid, update: F) -> BatonResult<SessionVersion>
    where
        F: Fn(&mut SessionVersion),
    {
        let mut last_err = None;
        for _ in 0..SESSION_APPEND_ATTEMPTS {
            let mut next = self.sessions.latest(session_id).await?.next();
            update(&mut next);
            match self.sessions.append(next.clone()).await {
                Ok(()) => return Ok(next),
                Err(BatonError::SessionConflict(msg)) => {
                    debug!(session_id = %session_id, "Gateway: session append raced, retrying");
                    last_err = Some(BatonError::SessionConflict(msg));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| BatonError::SessionConflict(session_id.to_string())))
    }

    async fn record_translation<S: Serialize, D: Serialize>(
        &self,
        session_id: Uuid,
        task_id: Uuid,
        direction: TranslationDirection,
        source: &S,
        destination: &D,
    ) -> BatonResult<TranslationRecord> {
        let record = TranslationRecord {
            id: Uuid::new_v4(),
            session_id,
            task_id,
            direction,
            source_digest: translate::digest(source)?,
            destination_digest: translate::digest(destination)?,
            destination_payload: serde_json::to_value(destination)?,
            created_at: Utc::now(),
        };
        self.sessions.record_translation(record).await
    }

    // -----------------------------------------------------------------------
    // Internal -> external
    // -----------------------------------------------------------------------

    /// Hands a pending task to its external agent and follows it until the
    /// agent reports a terminal state.
    ///
    /// `timeout` bounds the whole call. On timeout or cancellation the call
    /// returns without touching the task further; expiry belongs to the
    /// reaper.
    pub async fn dispatch_external(
        &self,
        task_id: Uuid,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> BatonResult<GatewayOutcome> {
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(BatonError::Cancelled(format!("external dispatch of task {task_id}")))
            }
            res = tokio::time::timeout(timeout, self.dispatch_inner(task_id)) => match res {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(task_id = %task_id, "Gateway: external dispatch timed out");
                    Err(BatonError::Timeout(format!("external dispatch of task {task_id}")))
                }
            },
        }
    }

    async fn dispatch_inner(&self, task_id: Uuid) -> BatonResult<GatewayOutcome> {
        let started = Instant::now();
        let direction = TranslationDirection::InternalToExternal;
        let task = self.ledger.get(task_id)?;
        if task.protocol != ProtocolBinding::External {
            return Err(BatonError::Protocol(format!(
                "task {task_id} targets an internal agent"
            )));
        }
        if task.state != TaskState::Pending {
            return Err(BatonError::InvalidTransition {
                task_id,
                from: TaskState::Pending,
                to: TaskState::Accepted,
                current: task.state,
            });
        }
        let agent = self.agent(&task.to_agent)?;

        let request = translate::to_external(&task);
        self.record_translation(
            task.session_id,
            task_id,
            direction,
            &InternalEnvelope::from(&*task),
            &request,
        )
        .await?;
        self.append_session(task.session_id, |v| {
            v.destination = Some(ProtocolBinding::External);
            if !v.task_ids.contains(&task_id) {
                v.task_ids.push(task_id);
            }
            v.markers
                .insert("handoff".into(), serde_json::json!(task_id.to_string()));
        })
        .await?;
        self.metrics.record_translation(direction, started.elapsed());

        info!(task_id = %task_id, agent = %task.to_agent, "Gateway: creating external task");
        let created = self
            .remote(&agent, "create_task", |client| {
                let request = request.clone();
                async move { client.create_task(&request).await }
            })
            .await;
        let status = match created {
            Ok(status) => status,
            Err(e) => return Err(self.fail_unacknowledged(&task, e)),
        };
        self.metrics.record_round_trip(direction, started.elapsed());

        self.ledger.set_external_id(task_id, request.id.clone())?;
        let external_id = request.id.clone();
        self.append_session(task.session_id, |v| {
            v.external_task_id = Some(external_id.clone());
        })
        .await?;

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut current = TaskState::Pending;
        let mut status = status;
        loop {
            if let Some(outcome) = self.apply_status(task_id, &mut current, &status)? {
                return Ok(outcome);
            }
            if status.state == ExternalState::Completed {
                break;
            }
            tokio::time::sleep(poll_interval).await;
            self.metrics.record_poll();
            status = self
                .remote(&agent, "get_status", |client| {
                    let id = request.id.clone();
                    async move { client.get_status(&id).await }
                })
                .await
                .map_err(|e| self.fail_acknowledged(&task, current, e))?;
        }

        let result = self
            .remote(&agent, "get_result", |client| {
                let id = request.id.clone();
                async move { client.get_result(&id).await }
            })
            .await
            .map_err(|e| self.fail_acknowledged(&task, current, e))?;
        self.accept_result(&task, result).await
    }

    async fn accept_result(
        &self,
        task: &Task,
        result: ExternalTaskResult,
    ) -> BatonResult<GatewayOutcome> {
        let artifacts = result
            .artifacts
            .iter()
            .map(|a| translate::artifact_from_external(a, task.id))
            .collect::<BatonResult<Vec<_>>>();
        let artifacts = match artifacts {
            Ok(artifacts) => artifacts,
            Err(e) => {
                let error = TaskError::new(
                    FailureReason::ExecutionError,
                    format!("external agent returned an invalid artifact: {e}"),
                );
                self.ledger.transition(
                    task.id,
                    TaskState::InProgress,
                    TaskState::Failed,
                    TransitionPayload::failure(error.clone()),
                )?;
                self.metrics
                    .record_failure(TranslationDirection::ExternalToInternal);
                return Ok(GatewayOutcome::Failed(error));
            }
        };

        let outcome = InternalOutcome::produced(task.id, result.result.clone(), artifacts.clone());
        self.record_translation(
            task.session_id,
            task.id,
            TranslationDirection::ExternalToInternal,
            &result,
            &outcome,
        )
        .await?;
        let produced = artifacts.clone();
        self.append_session(task.session_id, |v| {
            v.artifacts.extend(produced.iter().cloned());
            v.markers
                .insert("produced".into(), serde_json::json!(task.id.to_string()));
        })
        .await?;

        info!(
            task_id = %task.id,
            artifacts = artifacts.len(),
            "Gateway: external task produced a result"
        );
        Ok(GatewayOutcome::Produced {
            result: result.result,
            artifacts,
        })
    }

    fn fail_unacknowledged(&self, task: &Task, cause: BatonError) -> BatonError {
        self.metrics
            .record_failure(TranslationDirection::InternalToExternal);
        let transient = cause.is_transient();
        let reason = if transient {
            FailureReason::GatewayUnavailable
        } else {
            FailureReason::Rejected
        };
        let error = TaskError::new(
            reason,
            format!("external agent '{}' did not accept the task: {cause}", task.to_agent),
        )
        .with_details(serde_json::json!({
            "agent": task.to_agent,
            "attempts": self.config.retry.max_attempts,
            "error_kind": cause.kind(),
        }));
        warn!(task_id = %task.id, agent = %task.to_agent, error = %cause, "Gateway: handoff failed");
        if let Err(e) = self.ledger.force_fail(task.id, TaskState::Pending, error) {
            debug!(task_id = %task.id, error = %e, "Gateway: task already moved on");
        }
        if transient {
            unavailable(&task.to_agent, cause)
        } else {
            cause
        }
    }

    /// Fails a task the external agent acknowledged but could no longer be
    /// reached about.
    fn fail_acknowledged(&self, task: &Task, current: TaskState, cause: BatonError) -> BatonError {
        self.metrics
            .record_failure(TranslationDirection::ExternalToInternal);
        let transient = cause.is_transient();
        let reason = match (transient, current) {
            (true, _) => FailureReason::GatewayUnavailable,
            (false, TaskState::InProgress) => FailureReason::ExecutionError,
            (false, _) => FailureReason::Rejected,
        };
        let error = TaskError::new(
            reason,
            format!("lost contact with external agent '{}': {cause}", task.to_agent),
        )
        .with_details(serde_json::json!({
            "agent": task.to_agent,
            "attempts": self.config.retry.max_attempts,
            "error_kind": cause.kind(),
            "last_state": current,
        }));
        warn!(task_id = %task.id, agent = %task.to_agent, error = %cause, "Gateway: external agent unreachable");
        let failed = if current == TaskState::InProgress {
            self.ledger
                .transition(
                    task.id,
                    TaskState::InProgress,
                    TaskState::Failed,
                    TransitionPayload::failure(error),
                )
                .map(|_| ())
        } else {
            self.ledger.force_fail(task.id, current, error).map(|_| ())
        };
        if let Err(e) = failed {
            debug!(task_id = %task.id, error = %e, "Gateway: task already moved on");
        }
        unavailable(&task.to_agent, cause)
    }

    /// Moves the ledger towards the state the external agent reports.
    /// Returns an outcome when the report ends the dispatch.
    fn apply_status(
        &self,
        task_id: Uuid,
        current: &mut TaskState,
        status: &ExternalStatus,
    ) -> BatonResult<Option<GatewayOutcome>> {
        debug!(task_id = %task_id, external_state = ?status.state, "Gateway: status");
        match translate::state_from_external(status.state) {
            TaskState::Pending | TaskState::Accepted => {
                self.advance(task_id, current, TaskState::Accepted)?;
                Ok(None)
            }
            TaskState::InProgress | TaskState::Completed => {
                self.advance(task_id, current, TaskState::InProgress)?;
                Ok(None)
            }
            TaskState::Failed => {
                let message = status
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("external agent reported {:?}", status.state));
                let details = serde_json::json!({"external_state": status.state});
                let error = if *current == TaskState::InProgress {
                    let error = TaskError::new(FailureReason::ExecutionError, message)
                        .with_details(details);
                    self.ledger.transition(
                        task_id,
                        TaskState::InProgress,
                        TaskState::Failed,
                        TransitionPayload::failure(error.clone()),
                    )?;
                    error
                } else {
                    let error =
                        TaskError::new(FailureReason::Rejected, message).with_details(details);
                    self.ledger.force_fail(task_id, *current, error.clone())?;
                    error
                };
                *current = TaskState::Failed;
                Ok(Some(GatewayOutcome::Failed(error)))
            }
            TaskState::Cancelled => {
                if current.is_cancellable() {
                    self.ledger.transition(
                        task_id,
                        *current,
                        TaskState::Cancelled,
                        TransitionPayload::none(),
                    )?;
                    *current = TaskState::Cancelled;
                    Ok(Some(GatewayOutcome::Cancelled))
                } else {
                    let error = TaskError::new(
                        FailureReason::ExecutionError,
                        "external agent cancelled the task after starting it",
                    );
                    self.ledger.transition(
                        task_id,
                        *current,
                        TaskState::Failed,
                        TransitionPayload::failure(error.clone()),
                    )?;
                    *current = TaskState::Failed;
                    Ok(Some(GatewayOutcome::Failed(error)))
                }
            }
        }
    }

    fn advance(&self, task_id: Uuid, current: &mut TaskState, target: TaskState) -> BatonResult<()> {
        while *current != target {
            let next = match *current {
                TaskState::Pending => TaskState::Accepted,
                TaskState::Accepted => TaskState::InProgress,
                _ => break,
            };
            self.ledger
                .transition(task_id, *current, next, TransitionPayload::none())?;
            *current = next;
        }
        Ok(())
    }

    /// Asks the external agent to drop a task it was handed. A no-op for
    /// tasks that never crossed the gateway.
    pub async fn cancel_remote(&self, task_id: Uuid) -> BatonResult<()> {
        let task = self.ledger.get(task_id)?;
        let Some(external_id) = task.external_id.clone() else {
            return Ok(());
        };
        let agent = self.agent(&task.to_agent)?;
        self.remote(&agent, "cancel_task", |client| {
            let id = external_id.clone();
            async move { client.cancel_task(&id).await }
        })
        .await
    }

    // -----------------------------------------------------------------------
    // External -> internal
    // -----------------------------------------------------------------------

    /// Accepts a task sent by an external agent and creates the internal
    /// task for `to_agent`. Re-sending the same external id returns the
    /// task created the first time.
    pub async fn accept_external(
        &self,
        request: &ExternalTaskRequest,
        from_agent: &str,
        to_agent: &str,
    ) -> BatonResult<Uuid> {
        let started = Instant::now();
        let direction = TranslationDirection::ExternalToInternal;
        let mut inbound = self.inbound.lock().await;
        if let Some(id) = inbound.get(&request.id) {
            debug!(external_id = %request.id, task_id = %id, "Gateway: duplicate inbound task");
            return Ok(*id);
        }

        let mut task = match translate::to_internal(request, from_agent, to_agent, Uuid::nil()) {
            Ok(task) => task,
            Err(e) => {
                self.metrics.record_failure(direction);
                return Err(e);
            }
        };
        let session = self.sessions.open(ProtocolBinding::External, None).await?;
        task.session_id = session.session_id;
        let task_id = task.id;
        let envelope = InternalEnvelope::from(&task);
        self.ledger.create(task)?;

        self.record_translation(session.session_id, task_id, direction, request, &envelope)
            .await?;
        let external_id = request.id.clone();
        self.append_session(session.session_id, |v| {
            v.destination = Some(ProtocolBinding::Internal);
            v.task_ids.push(task_id);
            v.external_task_id = Some(external_id.clone());
        })
        .await?;
        inbound.insert(request.id.clone(), task_id);

        self.metrics.record_translation(direction, started.elapsed());
        self.metrics.record_round_trip(direction, started.elapsed());
        info!(
            external_id = %request.id,
            task_id = %task_id,
            to_agent = %to_agent,
            "Gateway: inbound external task accepted"
        );
        Ok(task_id)
    }

    /// Resolves an id used on the external side: an inbound external id, or
    /// a task id.
    pub async fn resolve_external_id(&self, id: &str) -> BatonResult<Uuid> {
        if let Some(task_id) = self.inbound.lock().await.get(id) {
            return Ok(*task_id);
        }
        Uuid::parse_str(id)
            .map_err(|_| BatonError::Protocol(format!("unknown external task id '{id}'")))
    }

    /// External status document for a task.
    pub fn external_status(&self, task_id: Uuid) -> BatonResult<ExternalStatus> {
        Ok(translate::status_for(&*self.ledger.get(task_id)?))
    }

    /// External result document for a task.
    pub fn external_result(&self, task_id: Uuid) -> BatonResult<ExternalTaskResult> {
        Ok(translate::result_for(&*self.ledger.get(task_id)?))
    }
}

fn unavailable(agent: &str, cause: BatonError) -> BatonError {
    if cause.is_transient() {
        BatonError::GatewayUnavailable(format!("external agent '{agent}': {cause}"))
    } else {
        cause
    }
}
