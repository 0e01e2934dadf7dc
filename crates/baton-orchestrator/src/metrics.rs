use crate::dispatcher::{Dispatcher, DispatcherMetricsSnapshot};
use crate::reaper::{ReaperMetricsSnapshot, ZombieReaper};
use baton_audit::AuditMetricsSnapshot;
use baton_gateway::GatewayMetricsSnapshot;
use baton_governor::{AgentHealth, ConnectionGovernor, EndpointStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Point-in-time view of every component's counters, as served by
/// `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Live tasks per state.
    pub tasks: BTreeMap<String, usize>,
    /// Archived tasks.
    pub archived_tasks: usize,
    /// Dispatcher counters.
    pub dispatcher: DispatcherMetricsSnapshot,
    /// Audit pass rates and latency.
    pub audit: AuditMetricsSnapshot,
    /// CAUTION results waiting for review.
    pub pending_cautions: usize,
    /// Escalations raised so far.
    pub escalations: usize,
    /// Translation and round-trip latency.
    pub gateway: GatewayMetricsSnapshot,
    /// Per-endpoint governor statistics.
    pub endpoints: Vec<EndpointStats>,
    /// Per-agent health.
    pub agents: BTreeMap<String, AgentHealth>,
    /// Reaper counters.
    pub reaper: ReaperMetricsSnapshot,
}

impl MetricsSnapshot {
    /// Collects a snapshot.
    pub fn collect(
        dispatcher: &Dispatcher,
        governor: &ConnectionGovernor,
        reaper: &ZombieReaper,
    ) -> Self {
        let ledger = dispatcher.ledger();
        Self {
            taken_at: Utc::now(),
            tasks: ledger.counts_by_state(),
            archived_tasks: ledger.archived_len(),
            dispatcher: dispatcher.metrics(),
            audit: dispatcher.pipeline().metrics(),
            pending_cautions: dispatcher.audits().pending_cautions().len(),
            escalations: dispatcher.escalations().len(),
            gateway: dispatcher.gateway().metrics(),
            endpoints: governor.stats(),
            agents: dispatcher.registry().health().snapshot(),
            reaper: reaper.metrics(),
        }
    }
}
