use crate::worker::{Worker, WorkerStatus};
use baton_core::{AgentDescriptor, BatonError, BatonResult, HealthStatus, ProtocolBinding};
use baton_governor::AgentHealthBoard;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

type AgentKey = (ProtocolBinding, String);

#[derive(Clone)]
struct Entry {
    descriptor: AgentDescriptor,
    worker: Option<Arc<dyn Worker>>,
    in_flight: Arc<AtomicUsize>,
}

/// One claimed unit of an agent's advertised concurrency. Released on drop.
pub struct AgentSlot {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for AgentSlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Registered agents, keyed by protocol and id.
///
/// Internal agents come with a [`Worker`]; external agents are descriptors
/// only, their client lives in the protocol gateway. Health always comes
/// from the shared [`AgentHealthBoard`].
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<AgentKey, Entry>>,
    health: Arc<AgentHealthBoard>,
}

impl AgentRegistry {
    /// Creates an empty registry reading health from `health`.
    pub fn new(health: Arc<AgentHealthBoard>) -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            health,
        }
    }

    /// The health board.
    pub fn health(&self) -> &Arc<AgentHealthBoard> {
        &self.health
    }

    fn insert(&self, descriptor: AgentDescriptor, worker: Option<Arc<dyn Worker>>) -> BatonResult<()> {
        let key = (descriptor.protocol, descriptor.id.clone());
        let mut agents = self.agents.write();
        if agents.contains_key(&key) {
            return Err(BatonError::Config(format!(
                "agent '{}' is already registered for the {} protocol",
                descriptor.id, descriptor.protocol
            )));
        }
        info!(
            agent = %descriptor.id,
            protocol = %descriptor.protocol,
            capabilities = ?descriptor.capabilities,
            max_concurrency = descriptor.max_concurrency,
            "Registry: agent registered"
        );
        agents.insert(
            key,
            Entry {
                descriptor,
                worker,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
        );
        Ok(())
    }

    /// Registers an internal worker.
    pub fn register_worker(&self, worker: Arc<dyn Worker>) -> BatonResult<AgentDescriptor> {
        let descriptor = worker.descriptor();
        if descriptor.protocol != ProtocolBinding::Internal {
            return Err(BatonError::Config(format!(
                "worker '{}' must speak the internal protocol",
                descriptor.id
            )));
        }
        self.insert(descriptor.clone(), Some(worker))?;
        Ok(descriptor)
    }

    /// Registers an external agent reachable through the gateway.
    pub fn register_external(&self, descriptor: AgentDescriptor) -> BatonResult<()> {
        if descriptor.protocol != ProtocolBinding::External {
            return Err(BatonError::Config(format!(
                "agent '{}' is not an external agent",
                descriptor.id
            )));
        }
        self.insert(descriptor, None)
    }

    fn with_health(&self, entry: &Entry) -> AgentDescriptor {
        let mut descriptor = entry.descriptor.clone();
        descriptor.health = self.health.status(&descriptor.health_key());
        descriptor
    }

    /// Descriptor of one agent.
    pub fn descriptor(&self, protocol: ProtocolBinding, id: &str) -> Option<AgentDescriptor> {
        self.agents
            .read()
            .get(&(protocol, id.to_string()))
            .map(|e| self.with_health(e))
    }

    /// Every registered agent.
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.agents.read().values().map(|e| self.with_health(e)).collect()
    }

    /// Worker behind an internal agent id.
    pub fn worker(&self, id: &str) -> Option<Arc<dyn Worker>> {
        self.agents
            .read()
            .get(&(ProtocolBinding::Internal, id.to_string()))
            .and_then(|e| e.worker.clone())
    }

    /// Looks up a named agent. Without a protocol hint, internal agents are
    /// preferred.
    pub fn resolve(&self, id: &str, protocol: Option<ProtocolBinding>) -> BatonResult<AgentDescriptor> {
        let candidates = match protocol {
            Some(p) => vec![p],
            None => vec![ProtocolBinding::Internal, ProtocolBinding::External],
        };
        candidates
            .into_iter()
            .find_map(|p| self.descriptor(p, id))
            .ok_or_else(|| BatonError::NoAgentAvailable(format!("no agent named '{id}'")))
    }

    /// Picks an agent declaring every tag in `capabilities`.
    ///
    /// Unreachable agents and agents at their concurrency limit are skipped;
    /// healthy agents win over degraded ones, then the least busy.
    pub fn select(
        &self,
        protocol: Option<ProtocolBinding>,
        capabilities: &BTreeSet<String>,
    ) -> BatonResult<AgentDescriptor> {
        let agents = self.agents.read();
        let mut candidates: Vec<(u8, usize, AgentDescriptor)> = agents
            .values()
            .filter(|e| protocol.map_or(true, |p| e.descriptor.protocol == p))
            .filter(|e| e.descriptor.has_capabilities(capabilities))
            .filter_map(|e| {
                let descriptor = self.with_health(e);
                let rank = match descriptor.health {
                    HealthStatus::Healthy => 0,
                    HealthStatus::Degraded => 1,
                    HealthStatus::Unreachable => return None,
                };
                let busy = e.in_flight.load(Ordering::Acquire);
                (busy < descriptor.max_concurrency).then_some((rank, busy, descriptor))
            })
            .collect();
        candidates.sort_by(|a, b| (a.0, a.1, &a.2.id).cmp(&(b.0, b.1, &b.2.id)));

        match candidates.into_iter().next() {
            Some((_, busy, descriptor)) => {
                debug!(agent = %descriptor.id, busy, "Registry: agent selected");
                Ok(descriptor)
            }
            None => Err(BatonError::NoAgentAvailable(format!(
                "no available agent with capabilities {capabilities:?}"
            ))),
        }
    }

    /// Claims one unit of an agent's concurrency, if it has one free.
    pub fn claim(&self, protocol: ProtocolBinding, id: &str) -> Option<AgentSlot> {
        let agents = self.agents.read();
        let entry = agents.get(&(protocol, id.to_string()))?;
        let max = entry.descriptor.max_concurrency;
        entry
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| AgentSlot {
                in_flight: entry.in_flight.clone(),
            })
    }

    /// Tasks currently running on an agent.
    pub fn in_flight(&self, protocol: ProtocolBinding, id: &str) -> usize {
        self.agents
            .read()
            .get(&(protocol, id.to_string()))
            .map_or(0, |e| e.in_flight.load(Ordering::Acquire))
    }

    /// Records the outcome of an interaction with an agent.
    pub fn observe(&self, descriptor: &AgentDescriptor, success: bool) {
        self.health.observe(&descriptor.health_key(), success);
    }

    /// Asks every internal worker for its status and feeds the answers into
    /// the health board.
    pub async fn probe(&self) -> BTreeMap<String, WorkerStatus> {
        let workers: Vec<(AgentDescriptor, Arc<dyn Worker>)> = self
            .agents
            .read()
            .values()
            .filter_map(|e| e.worker.clone().map(|w| (e.descriptor.clone(), w)))
            .collect();

        let mut statuses = BTreeMap::new();
        for (descriptor, worker) in workers {
            match worker.report_status().await {
                Ok(status) => {
                    self.observe(&descriptor, status.ready);
                    statuses.insert(descriptor.id, status);
                }
                Err(e) => {
                    warn!(agent = %descriptor.id, error = %e, "Registry: status probe failed");
                    self.observe(&descriptor, false);
                }
            }
        }
        statuses
    }
}
