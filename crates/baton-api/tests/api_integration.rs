#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use baton_api::{ApiServer, ApiState, AuthConfig};
use baton_audit::{AuditConfig, AuditPipeline, InMemoryArtifactStore, ProcessSandbox, ProcessSandboxConfig};
use baton_core::{AgentDescriptor, BatonResult, ProtocolBinding, RetryPolicy, Task};
use baton_gateway::{GatewayConfig, ProtocolGateway};
use baton_governor::{AgentHealthBoard, ConnectionGovernor};
use baton_ledger::{InMemorySessionStore, TaskLedger};
use baton_orchestrator::{
    AgentRegistry, Dispatcher, DispatcherConfig, OutputFile, ReaperConfig, WorkOutput, Worker,
    WorkerStatus, ZombieReaper,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Worker that answers with a fixed output.
struct FixedWorker {
    output: WorkOutput,
}

#[async_trait]
impl Worker for FixedWorker {
    fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor::new("coder", ProtocolBinding::Internal)
            .with_capabilities(["code", "implement"])
            .with_max_concurrency(4)
    }

    async fn accept(&self, _task: &Task) -> BatonResult<bool> {
        Ok(true)
    }

    async fn execute(&self, _task: &Task, _cancel: &CancellationToken) -> BatonResult<WorkOutput> {
        Ok(self.output.clone())
    }

    async fn report_status(&self) -> BatonResult<WorkerStatus> {
        Ok(WorkerStatus::ready())
    }
}

struct Harness {
    app: Router,
    dispatcher: Arc<Dispatcher>,
}

fn harness_with(output: WorkOutput, auth: AuthConfig) -> Harness {
    let retry = RetryPolicy {
        max_attempts: 1,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        jitter: 0.0,
    };
    let ledger = Arc::new(TaskLedger::new());
    let sessions = Arc::new(InMemorySessionStore::new());
    let governor = Arc::new(ConnectionGovernor::new(Vec::new()).unwrap());
    let registry = Arc::new(AgentRegistry::new(Arc::new(AgentHealthBoard::new(0.2))));
    registry
        .register_worker(Arc::new(FixedWorker { output }))
        .unwrap();
    let gateway = Arc::new(ProtocolGateway::new(
        ledger.clone(),
        sessions.clone(),
        governor.clone(),
        GatewayConfig {
            retry: retry.clone(),
            ..GatewayConfig::default()
        },
    ));
    let sandbox = Arc::new(
        ProcessSandbox::new(ProcessSandboxConfig {
            isolate_network: false,
            ..ProcessSandboxConfig::default()
        })
        .unwrap(),
    );
    let pipeline = Arc::new(
        AuditPipeline::new(
            Arc::new(InMemoryArtifactStore::new()),
            sandbox,
            AuditConfig::default(),
        )
        .unwrap(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        ledger.clone(),
        sessions.clone(),
        registry,
        gateway,
        pipeline,
        DispatcherConfig {
            retry,
            ..DispatcherConfig::default()
        },
    ));
    let reaper = Arc::new(ZombieReaper::new(ledger, sessions, ReaperConfig::default()));
    let state = Arc::new(ApiState {
        dispatcher: dispatcher.clone(),
        governor,
        reaper,
    });
    Harness {
        app: ApiServer::build_with_auth(state, auth),
        dispatcher,
    }
}

fn harness() -> Harness {
    harness_with(
        WorkOutput::result(json!({"answer": 4})),
        AuthConfig::default(),
    )
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, body)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

fn submit_body() -> Value {
    json!({
        "from_agent": "coordinator",
        "to_agent": "coder",
        "task_type": "implement",
        "priority": "high",
        "parameters": {"goal": "add numbers"}
    })
}

async fn submit(app: &Router) -> Uuid {
    let (status, body) = post(app, "/tasks", submit_body()).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["id"].as_str().unwrap().parse().unwrap()
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_submit_list_and_inspect_a_task() {
    let h = harness();
    let (status, body) = post(&h.app, "/tasks", submit_body()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "pending");
    assert_eq!(body["priority"], "high");
    assert_eq!(body["protocol"], "internal");
    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();

    let (status, list) = get(&h.app, "/tasks?state=pending,accepted&to_agent=coder").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["count"], 1);
    let (_, none) = get(&h.app, "/tasks?state=completed").await;
    assert_eq!(none["count"], 0);

    h.dispatcher
        .run_task(id, &CancellationToken::new())
        .await
        .unwrap();

    let (status, task) = get(&h.app, &format!("/tasks/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["state"], "completed");
    assert_eq!(task["result"]["answer"], 4);

    let (_, history) = get(&h.app, &format!("/tasks/{id}/history")).await;
    let states: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["to"].as_str().unwrap())
        .collect();
    assert_eq!(states, vec!["accepted", "in_progress", "completed"]);

    let (_, audits) = get(&h.app, &format!("/tasks/{id}/audits")).await;
    let audits = audits.as_array().unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0]["decision"], "go");
    assert!(audits[0]["review"].is_null());
}

#[tokio::test]
async fn test_bad_requests_map_to_error_bodies() {
    let h = harness();

    let (status, body) = get(&h.app, &format!("/tasks/{}", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "task_not_found");

    let (status, _) = get(&h.app, "/tasks/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = get(&h.app, "/tasks?state=done").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "protocol");

    let mut unknown = submit_body();
    unknown["to_agent"] = json!("nobody");
    let (status, body) = post(&h.app, "/tasks", unknown).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["kind"], "no_agent_available");
}

#[tokio::test]
async fn test_cancel_is_accepted_once() {
    let h = harness();
    let id = submit(&h.app).await;

    let (status, body) = post(&h.app, &format!("/tasks/{id}/cancel"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "cancelled");

    let (status, body) = post(&h.app, &format!("/tasks/{id}/cancel"), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "invalid_transition");
}

#[tokio::test]
async fn test_caution_decision_through_the_api() {
    let script = "#!/bin/sh\nrm -f missing.txt || true\necho done\n";
    let h = harness_with(
        WorkOutput::default().with_file(OutputFile::new("script", "cleanup.sh", script)),
        AuthConfig::default(),
    );
    let id = submit(&h.app).await;
    h.dispatcher
        .run_task(id, &CancellationToken::new())
        .await
        .unwrap();
    let (_, task) = get(&h.app, &format!("/tasks/{id}")).await;
    assert_eq!(task["state"], "in_progress");

    let uri = format!("/tasks/{id}/caution");
    let (status, _) = post(&h.app, &uri, json!({"accept": true, "reviewer": " "})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post(&h.app, &uri, json!({"accept": false, "reviewer": "lead"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "failed");
    assert_eq!(body["error"]["reason"], "caution_rejected");

    let (_, audits) = get(&h.app, &format!("/tasks/{id}/audits")).await;
    assert_eq!(audits[0]["decision"], "caution");
    assert_eq!(audits[0]["review"]["accepted"], false);
    assert_eq!(audits[0]["review"]["reviewer"], "lead");
}

// ---------------------------------------------------------------------------
// Operational views
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_metrics_agents_and_escalations() {
    let h = harness();
    let id = submit(&h.app).await;
    h.dispatcher
        .run_task(id, &CancellationToken::new())
        .await
        .unwrap();

    let (status, metrics) = get(&h.app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["tasks"]["completed"], 1);
    assert_eq!(metrics["tasks"]["pending"], 0);
    assert_eq!(metrics["dispatcher"]["completed"], 1);
    assert_eq!(metrics["audit"]["go"], 1);
    assert!(metrics["endpoints"].as_array().unwrap().is_empty());

    let (_, agents) = get(&h.app, "/agents").await;
    assert_eq!(agents.as_array().unwrap().len(), 1);
    assert_eq!(agents[0]["id"], "coder");
    assert_eq!(agents[0]["health"], "healthy");

    let (_, escalations) = get(&h.app, "/escalations").await;
    assert!(escalations.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_api_keys_guard_everything_but_health() {
    let h = harness_with(
        WorkOutput::result(json!({"answer": 4})),
        AuthConfig::new(vec!["secret".into()]),
    );

    let (status, body) = get(&h.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = get(&h.app, "/tasks").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = Request::get("/tasks")
        .header("authorization", "Bearer nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, wrong).await.0, StatusCode::UNAUTHORIZED);

    let bearer = Request::get("/tasks")
        .header("authorization", "Bearer secret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, bearer).await.0, StatusCode::OK);

    let header = Request::get("/metrics")
        .header("x-api-key", "secret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&h.app, header).await.0, StatusCode::OK);
}

// ---------------------------------------------------------------------------
// External protocol
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_inbound_external_task_lifecycle() {
    let h = harness();
    let create = |id: &str| {
        Request::post("/external/tasks")
            .header("content-type", "application/json")
            .header("x-agent-id", "partner")
            .body(Body::from(
                json!({"id": id, "type": "implement", "parameters": {"n": 1}, "timeout": 60})
                    .to_string(),
            ))
            .unwrap()
    };

    let (status, body) = send(&h.app, create("ext-1")).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["id"], "ext-1");
    assert_eq!(body["state"], "submitted");

    // Re-sending the same id does not create a second task.
    let (status, _) = send(&h.app, create("ext-1")).await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, list) = get(&h.app, "/tasks?from_agent=partner").await;
    assert_eq!(list["count"], 1);
    assert_eq!(list["tasks"][0]["to_agent"], "coder");
    assert_eq!(list["tasks"][0]["external_id"], "ext-1");
    let id: Uuid = list["tasks"][0]["id"].as_str().unwrap().parse().unwrap();

    h.dispatcher
        .run_task(id, &CancellationToken::new())
        .await
        .unwrap();
    let (_, status_doc) = get(&h.app, "/external/tasks/ext-1").await;
    assert_eq!(status_doc["state"], "completed");
    let (_, result) = get(&h.app, "/external/tasks/ext-1/result").await;
    assert_eq!(result["result"]["answer"], 4);

    send(&h.app, create("ext-2")).await;
    let (status, cancelled) = post(&h.app, "/external/tasks/ext-2/cancel", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["state"], "cancelled");

    let (status, body) = get(&h.app, "/external/tasks/unknown").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "protocol");
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_serves_over_tcp_until_cancelled() {
    let h = harness();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(ApiServer::serve(listener, h.app.clone(), cancel.clone()));

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["service"], "baton");

    cancel.cancel();
    server.await.unwrap().unwrap();
}
