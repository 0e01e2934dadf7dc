use crate::error::ApiError;
use crate::middleware::{auth_middleware, AuthConfig};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware as axum_mw,
    routing::{get, post},
    Json, Router,
};
use baton_audit::{AuditResult, CautionDecision};
use baton_core::{
    AgentDescriptor, BatonError, BatonResult, ProtocolBinding, Task, TaskRecord, TaskState,
};
use baton_gateway::{ExternalStatus, ExternalTaskRequest, ExternalTaskResult};
use baton_governor::ConnectionGovernor;
use baton_ledger::{TaskFilter, TransitionRecord};
use baton_orchestrator::{
    Dispatcher, Escalation, EscalationResolution, MetricsSnapshot, SubmitRequest, ZombieReaper,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

type ApiResult<T> = Result<T, ApiError>;

/// Shared state behind every route.
pub struct ApiState {
    /// Dispatcher, and through it the ledger, audits and gateway.
    pub dispatcher: Arc<Dispatcher>,
    /// Governor, for endpoint statistics.
    pub governor: Arc<ConnectionGovernor>,
    /// Reaper, for sweep statistics.
    pub reaper: Arc<ZombieReaper>,
}

/// The HTTP surface.
pub struct ApiServer;

impl ApiServer {
    /// Builds the router without authentication.
    pub fn build(state: Arc<ApiState>) -> Router {
        Self::build_with_auth(state, AuthConfig::default())
    }

    /// Builds the router. Every route except `/health` requires an API key
    /// when `auth` has any configured.
    pub fn build_with_auth(state: Arc<ApiState>, auth: AuthConfig) -> Router {
        Router::new()
            .route("/tasks", get(list_tasks).post(submit_task))
            .route("/tasks/{id}", get(get_task))
            .route("/tasks/{id}/history", get(task_history))
            .route("/tasks/{id}/audits", get(task_audits))
            .route("/tasks/{id}/cancel", post(cancel_task))
            .route("/tasks/{id}/caution", post(decide_caution))
            .route("/agents", get(list_agents))
            .route("/escalations", get(list_escalations))
            .route("/metrics", get(metrics))
            .route("/external/tasks", post(create_external))
            .route("/external/tasks/{id}", get(external_status))
            .route("/external/tasks/{id}/result", get(external_result))
            .route("/external/tasks/{id}/cancel", post(cancel_external))
            .route_layer(axum_mw::from_fn_with_state(Arc::new(auth), auth_middleware))
            .route("/health", get(health))
            .with_state(state)
    }

    /// Serves `app` on `listener` until `cancel` fires.
    pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> BatonResult<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "Api: listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        info!("Api: stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// A task as returned by the API: the wire record plus routing fields.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    /// Wire record.
    #[serde(flatten)]
    pub record: TaskRecord,
    /// Session the task belongs to.
    pub session_id: Uuid,
    /// Protocol of the target agent.
    pub protocol: ProtocolBinding,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// Task this one was re-planned from.
    pub parent_task: Option<Uuid>,
    /// Re-plan attempt.
    pub attempt: u32,
    /// Id on the external side, if any.
    pub external_id: Option<String>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            record: TaskRecord::from(task),
            session_id: task.session_id,
            protocol: task.protocol,
            updated_at: task.updated_at,
            parent_task: task.parent_task,
            attempt: task.attempt,
            external_id: task.external_id.clone(),
        }
    }
}

#[derive(Serialize)]
struct AuditView {
    #[serde(flatten)]
    result: AuditResult,
    review: Option<CautionDecision>,
}

#[derive(Serialize)]
struct EscalationView {
    #[serde(flatten)]
    escalation: Escalation,
    resolution: Option<EscalationResolution>,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    /// Comma-separated states.
    state: Option<String>,
    to_agent: Option<String>,
    from_agent: Option<String>,
    task_type: Option<String>,
    session_id: Option<Uuid>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CautionBody {
    accept: bool,
    reviewer: String,
}

#[derive(Debug, Deserialize)]
struct InboundTask {
    #[serde(flatten)]
    request: ExternalTaskRequest,
    /// Internal agent to route to; chosen by task type when absent.
    #[serde(default)]
    to_agent: Option<String>,
}

fn parse_states(raw: &str) -> BatonResult<Vec<TaskState>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            TaskState::ALL
                .into_iter()
                .find(|state| state.as_str() == s)
                .ok_or_else(|| BatonError::Protocol(format!("unknown task state '{s}'")))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "baton",
        "version": env!("CARGO_PKG_VERSION"),
        "tasks": state.dispatcher.ledger().counts_by_state(),
    }))
}

async fn submit_task(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<TaskView>)> {
    let id = state.dispatcher.submit(request).await?;
    let task = state.dispatcher.ledger().get(id)?;
    Ok((StatusCode::CREATED, Json(TaskView::from(task.as_ref()))))
}

async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let filter = TaskFilter {
        states: query.state.as_deref().map(parse_states).transpose()?.unwrap_or_default(),
        to_agent: query.to_agent,
        from_agent: query.from_agent,
        task_type: query.task_type,
        session_id: query.session_id,
        limit: Some(query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)),
        ..TaskFilter::default()
    };
    let tasks: Vec<TaskView> = state
        .dispatcher
        .ledger()
        .query(&filter)
        .iter()
        .map(|t| TaskView::from(t.as_ref()))
        .collect();
    Ok(Json(serde_json::json!({
        "count": tasks.len(),
        "tasks": tasks,
    })))
}

async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TaskView>> {
    let task = state.dispatcher.ledger().get(id)?;
    Ok(Json(TaskView::from(task.as_ref())))
}

async fn task_history(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<TransitionRecord>>> {
    Ok(Json(state.dispatcher.ledger().history(id)?))
}

async fn task_audits(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<serde_json::Value>>> {
    state.dispatcher.ledger().get(id)?;
    let audits = state.dispatcher.audits();
    let views = audits
        .for_task(id)
        .into_iter()
        .map(|result| {
            let review = audits.caution_decision(result.id);
            serde_json::to_value(AuditView { result, review })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(BatonError::from)?;
    Ok(Json(views))
}

async fn cancel_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TaskView>> {
    let task = state.dispatcher.cancel(id).await?;
    Ok(Json(TaskView::from(task.as_ref())))
}

async fn decide_caution(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<CautionBody>,
) -> ApiResult<Json<TaskView>> {
    if body.reviewer.trim().is_empty() {
        return Err(BatonError::Protocol("reviewer must not be empty".into()).into());
    }
    let task = state
        .dispatcher
        .resolve_caution(id, body.accept, &body.reviewer)?;
    Ok(Json(TaskView::from(task.as_ref())))
}

async fn list_agents(State(state): State<Arc<ApiState>>) -> Json<Vec<AgentDescriptor>> {
    Json(state.dispatcher.registry().descriptors())
}

async fn list_escalations(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<Json<Vec<serde_json::Value>>> {
    let log = state.dispatcher.escalations();
    let views = log
        .all()
        .into_iter()
        .map(|escalation| {
            let resolution = log.resolution(escalation.id);
            serde_json::to_value(EscalationView {
                escalation,
                resolution,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(BatonError::from)?;
    Ok(Json(views))
}

async fn metrics(State(state): State<Arc<ApiState>>) -> Json<MetricsSnapshot> {
    Json(MetricsSnapshot::collect(
        &state.dispatcher,
        &state.governor,
        &state.reaper,
    ))
}

// ---------------------------------------------------------------------------
// External protocol
// ---------------------------------------------------------------------------

async fn create_external(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(inbound): Json<InboundTask>,
) -> ApiResult<(StatusCode, Json<ExternalStatus>)> {
    let from_agent = headers
        .get("x-agent-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or("external")
        .to_string();
    let registry = state.dispatcher.registry();
    let descriptor = match &inbound.to_agent {
        Some(agent) => registry.resolve(agent, Some(ProtocolBinding::Internal))?,
        None => {
            let wanted = BTreeSet::from([inbound.request.task_type.clone()]);
            registry.select(Some(ProtocolBinding::Internal), &wanted)?
        }
    };

    let gateway = state.dispatcher.gateway();
    let task_id = gateway
        .accept_external(&inbound.request, &from_agent, &descriptor.id)
        .await?;
    Ok((StatusCode::CREATED, Json(gateway.external_status(task_id)?)))
}

async fn external_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExternalStatus>> {
    let gateway = state.dispatcher.gateway();
    let task_id = gateway.resolve_external_id(&id).await?;
    Ok(Json(gateway.external_status(task_id)?))
}

async fn external_result(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExternalTaskResult>> {
    let gateway = state.dispatcher.gateway();
    let task_id = gateway.resolve_external_id(&id).await?;
    Ok(Json(gateway.external_result(task_id)?))
}

async fn cancel_external(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExternalStatus>> {
    let gateway = state.dispatcher.gateway();
    let task_id = gateway.resolve_external_id(&id).await?;
    state.dispatcher.cancel(task_id).await?;
    Ok(Json(gateway.external_status(task_id)?))
}
