//! Protocol gateway for Baton.
//!
//! Internal workers are called directly with an [`InternalEnvelope`];
//! external agents speak a task protocol with creation, polled status,
//! results and artifact references. The [`ProtocolGateway`] translates
//! between the two, records every handoff in the session store, and maps
//! the external lifecycle onto the task ledger.
//!
//! Translation itself lives in [`translate`] and is pure.

/// External agent protocol clients.
pub mod client;
/// The gateway service.
pub mod gateway;
/// Handoff latency metrics.
pub mod metrics;
/// Internal and external message schemas.
pub mod schema;
pub mod translate;

pub use client::{ExternalAgentClient, HttpExternalClient};
pub use gateway::{GatewayConfig, GatewayOutcome, ProtocolGateway};
pub use metrics::{GatewayMetrics, GatewayMetricsSnapshot};
pub use schema::{
    ExternalArtifact, ExternalState, ExternalStatus, ExternalTaskRequest, ExternalTaskResult,
    InternalEnvelope, InternalOutcome,
};
