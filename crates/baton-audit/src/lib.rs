//! Audit pipeline for Baton.
//!
//! Every output a worker produces goes through three ordered stages before
//! its task may complete:
//!
//! 1. [`TheaterScanner`]: pattern scan for code that only looks finished.
//! 2. [`Sandbox`]: executable artifacts run under resource limits, either
//!    as a restricted child process ([`ProcessSandbox`]) or, with the
//!    `docker` feature, inside a throwaway container.
//! 3. [`ComplianceScorer`]: weighted structural checks that map onto
//!    GO / CAUTION / NO-GO.
//!
//! The first failing stage ends the audit with NO-GO. Results are kept in an
//! append-only [`AuditResultStore`].

/// Artifact content storage with hash verification.
pub mod artifact_store;
/// Stage 3 scoring.
pub mod compliance;
/// Container sandbox backend.
#[cfg(feature = "docker")]
pub mod docker;
/// Per-stage counters.
pub mod metrics;
/// Stage orchestration.
pub mod pipeline;
/// Audit result types.
pub mod report;
/// Stage 2 execution.
pub mod sandbox;
/// Audit history and CAUTION reviews.
pub mod store;
/// Stage 1 scanning.
pub mod theater;

pub use artifact_store::{ArtifactStore, FsArtifactStore, InMemoryArtifactStore};
pub use compliance::{ComplianceReport, ComplianceScorer, ComplianceWeights};
#[cfg(feature = "docker")]
pub use docker::{DockerSandbox, DockerSandboxConfig};
pub use metrics::{AuditMetrics, AuditMetricsSnapshot, StageCounts};
pub use pipeline::{AuditConfig, AuditPipeline};
pub use report::{
    AuditDecision, AuditResult, AuditStage, CautionDecision, Finding, Severity, StageOutcome,
    StageReport,
};
pub use sandbox::{
    ProcessSandbox, ProcessSandboxConfig, Sandbox, SandboxInput, SandboxLimits, SandboxReport,
    SandboxRequest,
};
pub use store::AuditResultStore;
pub use theater::{ScanReport, TheaterScanner};
