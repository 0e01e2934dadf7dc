//! Connection & rate governor for Baton.
//!
//! Every outbound call to a shared endpoint (external agents, tool servers)
//! goes through a [`ConnectionGovernor`], which enforces:
//!
//! - a per-endpoint concurrency limit,
//! - a bounded wait queue admitted in strict arrival order,
//! - a token-bucket request rate,
//! - an exponentially weighted health score per endpoint.
//!
//! The [`AgentHealthBoard`] keeps the same kind of score per worker agent.

/// Token bucket used for request rate limits.
mod bucket;
/// Endpoint configuration.
pub mod config;
/// Admission control and per-endpoint statistics.
pub mod governor;
/// Health scoring.
pub mod health;
/// Tool endpoint clients.
pub mod tool;

pub use config::EndpointConfig;
pub use governor::{ConnectionGovernor, EndpointPermit, EndpointStats};
pub use health::{AgentHealth, AgentHealthBoard};
pub use tool::{status_error, HttpToolEndpoint, ToolEndpoint, ToolRequest};
