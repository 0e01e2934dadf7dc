use baton_core::TranslationDirection;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;

/// Running latency aggregate.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyStats {
    /// Samples recorded.
    pub count: u64,
    /// Sum of samples in microseconds.
    pub total_us: u64,
    /// Largest sample in microseconds.
    pub max_us: u64,
    /// Most recent sample in microseconds.
    pub last_us: u64,
}

impl LatencyStats {
    fn record(&mut self, sample: Duration) {
        let us = sample.as_micros() as u64;
        self.count += 1;
        self.total_us = self.total_us.saturating_add(us);
        self.max_us = self.max_us.max(us);
        self.last_us = us;
    }

    /// Mean sample in microseconds.
    pub fn mean_us(&self) -> u64 {
        self.total_us.checked_div(self.count).unwrap_or(0)
    }
}

/// Latency and outcome counters for one handoff direction.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DirectionMetrics {
    /// Time spent translating and recording the handoff.
    pub translation: LatencyStats,
    /// Time from dispatch until the destination first acknowledged.
    pub first_round_trip: LatencyStats,
    /// Handoffs completed.
    pub handoffs: u64,
    /// Handoffs that failed.
    pub failed: u64,
}

/// Snapshot of gateway metrics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GatewayMetricsSnapshot {
    /// Internal to external handoffs.
    pub internal_to_external: DirectionMetrics,
    /// External to internal handoffs.
    pub external_to_internal: DirectionMetrics,
    /// Remote calls retried after a transient failure.
    pub retries: u64,
    /// Status polls issued.
    pub polls: u64,
}

/// Gateway latency and outcome counters.
#[derive(Default)]
pub struct GatewayMetrics {
    inner: Mutex<GatewayMetricsSnapshot>,
}

impl GatewayMetrics {
    fn with<F: FnOnce(&mut DirectionMetrics)>(&self, direction: TranslationDirection, f: F) {
        let mut inner = self.inner.lock();
        match direction {
            TranslationDirection::InternalToExternal => f(&mut inner.internal_to_external),
            TranslationDirection::ExternalToInternal => f(&mut inner.external_to_internal),
        }
    }

    /// Records translation latency.
    pub fn record_translation(&self, direction: TranslationDirection, elapsed: Duration) {
        self.with(direction, |m| m.translation.record(elapsed));
    }

    /// Records first-acknowledgement latency and counts the handoff.
    pub fn record_round_trip(&self, direction: TranslationDirection, elapsed: Duration) {
        self.with(direction, |m| {
            m.first_round_trip.record(elapsed);
            m.handoffs += 1;
        });
    }

    /// Counts a failed handoff.
    pub fn record_failure(&self, direction: TranslationDirection) {
        self.with(direction, |m| m.failed += 1);
    }

    /// Counts a retried remote call.
    pub fn record_retry(&self) {
        self.inner.lock().retries += 1;
    }

    /// Counts a status poll.
    pub fn record_poll(&self) {
        self.inner.lock().polls += 1;
    }

    /// Current values.
    pub fn snapshot(&self) -> GatewayMetricsSnapshot {
        *self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_aggregation() {
        let metrics = GatewayMetrics::default();
        let d = TranslationDirection::InternalToExternal;
        metrics.record_translation(d, Duration::from_micros(100));
        metrics.record_translation(d, Duration::from_micros(300));
        metrics.record_round_trip(d, Duration::from_millis(2));
        metrics.record_failure(TranslationDirection::ExternalToInternal);

        let snap = metrics.snapshot();
        assert_eq!(snap.internal_to_external.translation.count, 2);
        assert_eq!(snap.internal_to_external.translation.max_us, 300);
        assert_eq!(snap.internal_to_external.translation.mean_us(), 200);
        assert_eq!(snap.internal_to_external.translation.last_us, 300);
        assert_eq!(snap.internal_to_external.handoffs, 1);
        assert_eq!(snap.external_to_internal.failed, 1);
    }
}
