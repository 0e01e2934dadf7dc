//! Core types and error definitions for Baton.
//!
//! This crate holds the data model shared by every Baton crate: tasks and
//! their lifecycle table, versioned session records, agent descriptors, the
//! error taxonomy and the one retry policy used by the gateway, the governor
//! and the dispatcher.
//!
//! # Main types
//!
//! - [`BatonError`]: Unified error enum for all Baton subsystems.
//! - [`BatonResult`]: Convenience alias for `Result<T, BatonError>`.
//! - [`Task`] / [`TaskState`]: A unit of delegated work and its lifecycle.
//! - [`SessionVersion`]: One immutable version of a session record.
//! - [`AgentDescriptor`]: Capability-tagged description of a worker.
//! - [`RetryPolicy`]: Bounded exponential backoff with jitter.
//! - [`TaskRecord`]: Wire representation of a task.

/// Agent descriptors and health classification.
pub mod agent;
/// Error taxonomy.
pub mod error;
/// Unified retry policy.
pub mod retry;
/// Session versions and translation records.
pub mod session;
/// Task model and lifecycle table.
pub mod task;
/// Wire schema.
pub mod wire;

pub use agent::{AgentDescriptor, HealthStatus};
pub use error::{BatonError, BatonResult};
pub use retry::RetryPolicy;
pub use session::{SessionVersion, TranslationDirection, TranslationRecord};
pub use task::{
    content_hash, ArtifactRef, FailureReason, Priority, ProtocolBinding, Task, TaskError,
    TaskState,
};
pub use wire::TaskRecord;
