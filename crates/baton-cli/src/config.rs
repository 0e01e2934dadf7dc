use baton_audit::{AuditConfig, ProcessSandboxConfig};
use baton_core::{BatonError, BatonResult, RetryPolicy};
use baton_gateway::GatewayConfig;
use baton_governor::EndpointConfig;
use baton_orchestrator::{DispatcherConfig, ReaperConfig, TtlConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Contents of `baton.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatonConfig {
    /// Root for session logs and artifacts.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Task retention.
    #[serde(default)]
    pub ledger: LedgerSection,
    /// Session store backend and retention.
    #[serde(default)]
    pub sessions: SessionsSection,
    /// Task TTL per protocol.
    #[serde(default)]
    pub ttl: TtlConfig,
    /// Reaper timing.
    #[serde(default)]
    pub reaper: ReaperSection,
    /// Dispatcher timing and limits.
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    /// Retry policy shared by the dispatcher and the gateway.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// External agent polling.
    #[serde(default)]
    pub gateway: GatewaySection,
    /// Audit thresholds, sandbox and artifact storage.
    #[serde(default)]
    pub audit: AuditSection,
    /// Governed endpoints.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// External agents.
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    /// Planning collaborator.
    #[serde(default)]
    pub planner: PlannerSection,
    /// HTTP surface.
    #[serde(default)]
    pub api: ApiSection,
}

/// `[ledger]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSection {
    /// Age after which terminal tasks are archived.
    #[serde(default = "default_task_retention_secs")]
    pub retention_secs: u64,
}

/// Where session versions are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    /// Append-only JSONL files under `data_dir/sessions`.
    Jsonl,
    /// Process memory only.
    Memory,
}

/// `[sessions]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsSection {
    /// Storage backend.
    #[serde(default = "default_session_backend")]
    pub backend: SessionBackend,
    /// Age after which sessions are pruned.
    #[serde(default = "default_session_retention_secs")]
    pub retention_secs: u64,
}

/// `[reaper]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperSection {
    /// Seconds between sweeps.
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    /// Longest a task may stay `in_progress`.
    #[serde(default = "default_in_progress_ceiling_secs")]
    pub in_progress_ceiling_secs: u64,
}

/// `[dispatcher]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSection {
    /// Milliseconds between pending-task scans.
    #[serde(default = "default_dispatch_poll_ms")]
    pub poll_interval_ms: u64,
    /// How long a worker may take to acknowledge.
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    /// How long a worker may take to execute.
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    /// Tasks running at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Re-plans allowed per original task.
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    /// Smoothing factor of agent health scores.
    #[serde(default = "default_health_alpha")]
    pub health_alpha: f64,
}

/// `[gateway]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    /// Milliseconds between status polls.
    #[serde(default = "default_gateway_poll_ms")]
    pub poll_interval_ms: u64,
    /// Timeout of one remote call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Which sandbox runs stage 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    /// Local child processes with rlimits.
    Process,
    /// Docker containers. Needs the `docker` feature.
    Docker,
}

/// Where produced artifacts are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactBackend {
    /// Files under `data_dir/artifacts`.
    Fs,
    /// Process memory only.
    Memory,
}

/// `[audit]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSection {
    /// Thresholds, weights, limits and runners.
    #[serde(flatten)]
    pub pipeline: AuditConfig,
    /// Sandbox backend.
    #[serde(default = "default_sandbox_backend")]
    pub sandbox: SandboxBackend,
    /// Artifact store backend.
    #[serde(default = "default_artifact_backend")]
    pub artifacts: ArtifactBackend,
    /// Process sandbox settings.
    #[serde(default)]
    pub process: ProcessSandboxConfig,
    /// Docker sandbox settings.
    #[cfg(feature = "docker")]
    #[serde(default)]
    pub docker: baton_audit::DockerSandboxConfig,
}

/// `[[agents]]`: an agent reached over the external protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    /// Agent id tasks are addressed to.
    pub id: String,
    /// Base URL of the agent's task API.
    pub url: String,
    /// Capabilities used for selection.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Tasks the agent takes at once.
    #[serde(default = "default_agent_concurrency")]
    pub max_concurrency: usize,
    /// Governed endpoint every call goes through.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// `[planner]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerSection {
    /// Planning collaborator URL. Without one, escalations are only logged.
    #[serde(default)]
    pub url: Option<String>,
    /// Timeout of one planning call.
    #[serde(default = "default_planner_timeout_ms")]
    pub timeout_ms: u64,
}

/// `[api]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Accepted API keys. Empty disables authentication.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_task_retention_secs() -> u64 {
    ReaperConfig::default().task_retention_secs
}
fn default_session_backend() -> SessionBackend {
    SessionBackend::Jsonl
}
fn default_session_retention_secs() -> u64 {
    ReaperConfig::default().session_retention_secs
}
fn default_reaper_interval_secs() -> u64 {
    ReaperConfig::default().interval_secs
}
fn default_in_progress_ceiling_secs() -> u64 {
    ReaperConfig::default().in_progress_ceiling_secs
}
fn default_dispatch_poll_ms() -> u64 {
    DispatcherConfig::default().poll_interval_ms
}
fn default_accept_timeout_ms() -> u64 {
    DispatcherConfig::default().accept_timeout_ms
}
fn default_execution_timeout_ms() -> u64 {
    DispatcherConfig::default().execution_timeout_ms
}
fn default_max_in_flight() -> usize {
    DispatcherConfig::default().max_in_flight
}
fn default_max_replans() -> u32 {
    DispatcherConfig::default().max_replans
}
fn default_health_alpha() -> f64 {
    0.2
}
fn default_gateway_poll_ms() -> u64 {
    GatewayConfig::default().poll_interval_ms
}
fn default_request_timeout_ms() -> u64 {
    GatewayConfig::default().request_timeout_ms
}
fn default_sandbox_backend() -> SandboxBackend {
    SandboxBackend::Process
}
fn default_artifact_backend() -> ArtifactBackend {
    ArtifactBackend::Fs
}
fn default_agent_concurrency() -> usize {
    4
}
fn default_planner_timeout_ms() -> u64 {
    30_000
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8700
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            retention_secs: default_task_retention_secs(),
        }
    }
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            backend: default_session_backend(),
            retention_secs: default_session_retention_secs(),
        }
    }
}

impl Default for ReaperSection {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            in_progress_ceiling_secs: default_in_progress_ceiling_secs(),
        }
    }
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_dispatch_poll_ms(),
            accept_timeout_ms: default_accept_timeout_ms(),
            execution_timeout_ms: default_execution_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            max_replans: default_max_replans(),
            health_alpha: default_health_alpha(),
        }
    }
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_gateway_poll_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            pipeline: AuditConfig::default(),
            sandbox: default_sandbox_backend(),
            artifacts: default_artifact_backend(),
            process: ProcessSandboxConfig::default(),
            #[cfg(feature = "docker")]
            docker: baton_audit::DockerSandboxConfig::default(),
        }
    }
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_planner_timeout_ms(),
        }
    }
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: Vec::new(),
        }
    }
}

impl Default for BatonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ledger: LedgerSection::default(),
            sessions: SessionsSection::default(),
            ttl: TtlConfig::default(),
            reaper: ReaperSection::default(),
            dispatcher: DispatcherSection::default(),
            retry: RetryPolicy::default(),
            gateway: GatewaySection::default(),
            audit: AuditSection::default(),
            endpoints: Vec::new(),
            agents: Vec::new(),
            planner: PlannerSection::default(),
            api: ApiSection::default(),
        }
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl BatonConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(raw: &str) -> BatonResult<Self> {
        toml::from_str(raw).map_err(|e| BatonError::Config(format!("invalid config: {e}")))
    }

    /// Reads and parses a config file.
    pub async fn load(path: &Path) -> BatonResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            BatonError::Config(format!("failed to read config file '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Checks cross-field constraints the parser cannot.
    pub fn validate(&self) -> BatonResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(BatonError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.dispatcher.max_in_flight == 0 {
            return Err(BatonError::Config("dispatcher.max_in_flight must be at least 1".into()));
        }
        if !(self.dispatcher.health_alpha > 0.0 && self.dispatcher.health_alpha <= 1.0) {
            return Err(BatonError::Config("dispatcher.health_alpha must be in (0, 1]".into()));
        }
        if self.ttl.internal_secs == 0 || self.ttl.external_secs == 0 {
            return Err(BatonError::Config("ttl values must be positive".into()));
        }
        if self.reaper.interval_secs == 0 {
            return Err(BatonError::Config("reaper.interval_secs must be positive".into()));
        }
        if self.audit.pipeline.caution_threshold > self.audit.pipeline.go_threshold {
            return Err(BatonError::Config(
                "audit.caution_threshold must not exceed audit.go_threshold".into(),
            ));
        }
        #[cfg(not(feature = "docker"))]
        if self.audit.sandbox == SandboxBackend::Docker {
            return Err(BatonError::Config(
                "audit.sandbox = \"docker\" needs a build with the docker feature".into(),
            ));
        }

        let mut endpoints = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.trim().is_empty() {
                return Err(BatonError::Config("endpoint name must not be empty".into()));
            }
            if !endpoints.insert(endpoint.name.as_str()) {
                return Err(BatonError::Config(format!(
                    "duplicate endpoint '{}'",
                    endpoint.name
                )));
            }
        }

        let mut agents = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(BatonError::Config("agent id must not be empty".into()));
            }
            if !agents.insert(agent.id.as_str()) {
                return Err(BatonError::Config(format!("duplicate agent '{}'", agent.id)));
            }
            if !is_http_url(&agent.url) {
                return Err(BatonError::Config(format!(
                    "agent '{}' url must be http(s), got '{}'",
                    agent.id, agent.url
                )));
            }
            if let Some(endpoint) = &agent.endpoint {
                if !endpoints.contains(endpoint.as_str()) {
                    return Err(BatonError::UnknownEndpoint(endpoint.clone()));
                }
            }
        }

        if let Some(url) = &self.planner.url {
            if !is_http_url(url) {
                return Err(BatonError::Config(format!("planner url must be http(s), got '{url}'")));
            }
        }
        Ok(())
    }

    /// Dispatcher settings with the shared retry policy and TTLs.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval_ms: self.dispatcher.poll_interval_ms,
            accept_timeout_ms: self.dispatcher.accept_timeout_ms,
            execution_timeout_ms: self.dispatcher.execution_timeout_ms,
            max_in_flight: self.dispatcher.max_in_flight,
            max_replans: self.dispatcher.max_replans,
            retry: self.retry.clone(),
            ttl: self.ttl.clone(),
        }
    }

    /// Gateway settings with the shared retry policy.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            poll_interval_ms: self.gateway.poll_interval_ms,
            request_timeout_ms: self.gateway.request_timeout_ms,
            retry: self.retry.clone(),
        }
    }

    /// Reaper settings, retention taken from `[ledger]` and `[sessions]`.
    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval_secs: self.reaper.interval_secs,
            in_progress_ceiling_secs: self.reaper.in_progress_ceiling_secs,
            task_retention_secs: self.ledger.retention_secs,
            session_retention_secs: self.sessions.retention_secs,
        }
    }
}
