use crate::config::{ArtifactBackend, BatonConfig, SandboxBackend, SessionBackend};
use anyhow::Context;
use baton_audit::{
    ArtifactStore, AuditPipeline, FsArtifactStore, InMemoryArtifactStore, ProcessSandbox, Sandbox,
};
use baton_core::{AgentDescriptor, ProtocolBinding};
use baton_gateway::{HttpExternalClient, ProtocolGateway};
use baton_governor::{AgentHealthBoard, ConnectionGovernor};
use baton_ledger::{InMemorySessionStore, JsonlSessionStore, SessionStore, TaskLedger};
use baton_orchestrator::{AgentRegistry, Dispatcher, HttpPlanner, ZombieReaper};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The long-running services built from a config.
pub struct Runtime {
    /// Dispatcher, owning the ledger, gateway and audit pipeline.
    pub dispatcher: Arc<Dispatcher>,
    /// Endpoint governor.
    pub governor: Arc<ConnectionGovernor>,
    /// Expiry and retention sweeper.
    pub reaper: Arc<ZombieReaper>,
}

/// Opens the configured session store.
pub async fn session_store(config: &BatonConfig) -> anyhow::Result<Arc<dyn SessionStore>> {
    Ok(match config.sessions.backend {
        SessionBackend::Jsonl => {
            let dir = config.data_dir.join("sessions");
            let store = JsonlSessionStore::new(dir.clone())
                .await
                .with_context(|| format!("failed to open session store at '{}'", dir.display()))?;
            Arc::new(store)
        }
        SessionBackend::Memory => {
            warn!("Runtime: sessions are kept in memory and lost on exit");
            Arc::new(InMemorySessionStore::new())
        }
    })
}

async fn artifact_store(config: &BatonConfig) -> anyhow::Result<Arc<dyn ArtifactStore>> {
    Ok(match config.audit.artifacts {
        ArtifactBackend::Fs => Arc::new(FsArtifactStore::new(config.data_dir.join("artifacts")).await?),
        ArtifactBackend::Memory => Arc::new(InMemoryArtifactStore::new()),
    })
}

async fn sandbox(config: &BatonConfig) -> anyhow::Result<Arc<dyn Sandbox>> {
    match config.audit.sandbox {
        SandboxBackend::Process => Ok(Arc::new(ProcessSandbox::new(config.audit.process.clone())?)),
        #[cfg(feature = "docker")]
        SandboxBackend::Docker => Ok(Arc::new(
            baton_audit::DockerSandbox::new(config.audit.docker.clone()).await?,
        )),
        #[cfg(not(feature = "docker"))]
        SandboxBackend::Docker => anyhow::bail!("docker sandbox requested but not compiled in"),
    }
}

impl Runtime {
    /// Builds every service. External agents from `[[agents]]` are
    /// registered with both the gateway and the agent registry.
    pub async fn build(config: &BatonConfig) -> anyhow::Result<Self> {
        let ledger = Arc::new(TaskLedger::new());
        let sessions = session_store(config).await?;
        let governor = Arc::new(ConnectionGovernor::new(config.endpoints.clone())?);
        let gateway = Arc::new(ProtocolGateway::new(
            ledger.clone(),
            sessions.clone(),
            governor.clone(),
            config.gateway_config(),
        ));
        let registry = Arc::new(AgentRegistry::new(Arc::new(AgentHealthBoard::new(
            config.dispatcher.health_alpha,
        ))));

        let request_timeout = Duration::from_millis(config.gateway.request_timeout_ms);
        for agent in &config.agents {
            let client = HttpExternalClient::new(&agent.url, request_timeout)?;
            gateway.register_agent(&agent.id, Arc::new(client), agent.endpoint.clone())?;
            registry.register_external(
                AgentDescriptor::new(&agent.id, ProtocolBinding::External)
                    .with_capabilities(agent.capabilities.clone())
                    .with_max_concurrency(agent.max_concurrency),
            )?;
        }

        let pipeline = Arc::new(AuditPipeline::new(
            artifact_store(config).await?,
            sandbox(config).await?,
            config.audit.pipeline.clone(),
        )?);

        let mut dispatcher = Dispatcher::new(
            ledger.clone(),
            sessions.clone(),
            registry,
            gateway,
            pipeline,
            config.dispatcher_config(),
        );
        if let Some(url) = &config.planner.url {
            let planner = HttpPlanner::new(url, Duration::from_millis(config.planner.timeout_ms))?;
            dispatcher = dispatcher.with_planner(Arc::new(planner));
        }

        let reaper = Arc::new(ZombieReaper::new(ledger, sessions, config.reaper_config()));
        info!(
            endpoints = config.endpoints.len(),
            agents = config.agents.len(),
            planner = config.planner.url.is_some(),
            "Runtime: services built"
        );
        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            governor,
            reaper,
        })
    }
}
