//! Dispatch, agent registry, escalation and expiry for Baton.
//!
//! # Main types
//!
//! - [`Dispatcher`]: creates tasks, routes them to internal workers or
//!   through the protocol gateway, and gates completion on the audit
//!   pipeline.
//! - [`AgentRegistry`]: registered agents, their in-flight counts and
//!   health-aware selection.
//! - [`Worker`]: the internal agent protocol.
//! - [`EscalationLog`] and [`PlanningCollaborator`]: NO-GO results sent
//!   back for revision.
//! - [`ZombieReaper`]: force-fails tasks stuck past their deadline.

/// Task submission, dispatch and audit gating.
pub mod dispatcher;
/// Aggregate metrics snapshot.
pub mod metrics;
/// Escalations and planning collaborators.
pub mod planner;
/// Expiry and retention.
pub mod reaper;
/// Agent registry.
pub mod registry;
/// Internal worker protocol.
pub mod worker;

pub use dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherMetricsSnapshot, RunReport, SubmitRequest, TtlConfig,
};
pub use metrics::MetricsSnapshot;
pub use planner::{
    Escalation, EscalationLog, EscalationResolution, HttpPlanner, NullPlanner,
    PlanningCollaborator, RevisedTask,
};
pub use reaper::{ReaperConfig, ReaperMetricsSnapshot, RetentionStats, SweepStats, ZombieReaper};
pub use registry::{AgentRegistry, AgentSlot};
pub use worker::{OutputFile, WorkOutput, Worker, WorkerStatus};
