//! HTTP surface of Baton.
//!
//! Operational routes expose the task ledger, audit history, escalations
//! and metrics, and accept CAUTION decisions and cancellations. The
//! `/external/tasks` routes speak the external agent protocol so that other
//! agents can hand tasks to Baton's internal workers.
//!
//! | route | purpose |
//! |---|---|
//! | `GET /health` | liveness and task counts |
//! | `POST /tasks`, `GET /tasks` | submit, list |
//! | `GET /tasks/{id}` | one task |
//! | `GET /tasks/{id}/history` | state changes |
//! | `GET /tasks/{id}/audits` | audit results and reviews |
//! | `POST /tasks/{id}/cancel` | cancel before execution |
//! | `POST /tasks/{id}/caution` | accept or reject a CAUTION result |
//! | `GET /agents`, `GET /escalations`, `GET /metrics` | registry, escalations, counters |
//! | `POST /external/tasks` | inbound external task |
//! | `GET /external/tasks/{id}[/result]` | external status and result |
//! | `POST /external/tasks/{id}/cancel` | external cancel |

/// Error to response mapping.
pub mod error;
/// API key middleware.
pub mod middleware;
/// Router and handlers.
pub mod server;

pub use error::{status_for, ApiError};
pub use middleware::AuthConfig;
pub use server::{ApiServer, ApiState, TaskView};
