use crate::report::{AuditDecision, AuditStage, StageOutcome};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct StageCounters {
    passed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Pass / fail / skip counts of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    /// Runs that passed.
    pub passed: u64,
    /// Runs that failed.
    pub failed: u64,
    /// Audits where the stage did not run.
    pub skipped: u64,
}

/// Snapshot of [`AuditMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditMetricsSnapshot {
    /// Stage 1 counts.
    pub theater_scan: StageCounts,
    /// Stage 2 counts.
    pub sandbox: StageCounts,
    /// Stage 3 counts.
    pub compliance: StageCounts,
    /// Audits decided GO.
    pub go: u64,
    /// Audits decided CAUTION.
    pub caution: u64,
    /// Audits decided NO-GO.
    pub no_go: u64,
}

/// Per-stage audit counters.
#[derive(Default)]
pub struct AuditMetrics {
    stages: [StageCounters; 3],
    go: AtomicU64,
    caution: AtomicU64,
    no_go: AtomicU64,
}

fn index(stage: AuditStage) -> usize {
    match stage {
        AuditStage::TheaterScan => 0,
        AuditStage::Sandbox => 1,
        AuditStage::Compliance => 2,
    }
}

impl AuditMetrics {
    /// Counts one stage outcome.
    pub fn record_stage(&self, stage: AuditStage, outcome: StageOutcome) {
        let c = &self.stages[index(stage)];
        let counter = match outcome {
            StageOutcome::Passed => &c.passed,
            StageOutcome::Failed => &c.failed,
            StageOutcome::Skipped => &c.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one aggregate decision.
    pub fn record_decision(&self, decision: AuditDecision) {
        let counter = match decision {
            AuditDecision::Go => &self.go,
            AuditDecision::Caution => &self.caution,
            AuditDecision::NoGo => &self.no_go,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn counts(&self, stage: AuditStage) -> StageCounts {
        let c = &self.stages[index(stage)];
        StageCounts {
            passed: c.passed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
        }
    }

    /// Current values.
    pub fn snapshot(&self) -> AuditMetricsSnapshot {
        AuditMetricsSnapshot {
            theater_scan: self.counts(AuditStage::TheaterScan),
            sandbox: self.counts(AuditStage::Sandbox),
            compliance: self.counts(AuditStage::Compliance),
            go: self.go.load(Ordering::Relaxed),
            caution: self.caution.load(Ordering::Relaxed),
            no_go: self.no_go.load(Ordering::Relaxed),
        }
    }
}
