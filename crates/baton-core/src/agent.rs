use crate::task::ProtocolBinding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Health of an agent or endpoint as observed by the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Succeeding normally.
    Healthy,
    /// Failing often enough to route around when possible.
    Degraded,
    /// Failing almost every call.
    Unreachable,
}

impl HealthStatus {
    /// Score at or above which a target counts as healthy.
    pub const HEALTHY_FLOOR: f64 = 0.9;
    /// Score at or above which a target counts as degraded rather than unreachable.
    pub const DEGRADED_FLOOR: f64 = 0.5;

    /// Maps an exponentially-weighted success ratio to a status.
    pub fn from_score(score: f64) -> Self {
        if score >= Self::HEALTHY_FLOOR {
            HealthStatus::Healthy
        } else if score >= Self::DEGRADED_FLOOR {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unreachable
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Describes a registered worker agent.
///
/// `health` is filled in by the registry from the governor's observations;
/// workers never set it themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Agent id, unique within its protocol namespace.
    pub id: String,
    /// Protocol the agent speaks.
    pub protocol: ProtocolBinding,
    /// Declared capability tags.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Advertised concurrency limit.
    pub max_concurrency: usize,
    /// Derived health.
    #[serde(default = "default_health")]
    pub health: HealthStatus,
}

fn default_health() -> HealthStatus {
    HealthStatus::Healthy
}

impl AgentDescriptor {
    /// Creates a descriptor with no capabilities and concurrency 1.
    pub fn new(id: impl Into<String>, protocol: ProtocolBinding) -> Self {
        Self {
            id: id.into(),
            protocol,
            capabilities: BTreeSet::new(),
            max_concurrency: 1,
            health: HealthStatus::Healthy,
        }
    }

    /// Adds capability tags.
    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(caps.into_iter().map(Into::into));
        self
    }

    /// Sets the advertised concurrency limit.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Key used by the health board: `protocol/id`.
    pub fn health_key(&self) -> String {
        format!("{}/{}", self.protocol, self.id)
    }

    /// Whether every required tag is declared.
    pub fn has_capabilities<'a, I>(&self, required: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        required.into_iter().all(|c| self.capabilities.contains(c))
    }
}
