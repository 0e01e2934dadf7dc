use baton_core::HealthStatus;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;

/// One step of the exponentially weighted success ratio.
pub fn ewma(score: f64, success: bool, alpha: f64) -> f64 {
    let x = if success { 1.0 } else { 0.0 };
    alpha * x + (1.0 - alpha) * score
}

/// Health of one agent as seen by the board.
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    /// Smoothed success ratio.
    pub score: f64,
    /// Derived status.
    pub status: HealthStatus,
    /// Observations recorded.
    pub observations: u64,
}

/// Health scores of worker agents, keyed by `protocol/id`.
///
/// This is the only source agent descriptors take their health from.
pub struct AgentHealthBoard {
    alpha: f64,
    scores: DashMap<String, (f64, u64)>,
}

impl AgentHealthBoard {
    /// Creates a board with the given smoothing factor.
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            scores: DashMap::new(),
        }
    }

    /// Records the outcome of one interaction with an agent.
    pub fn observe(&self, agent_key: &str, success: bool) {
        let mut entry = self.scores.entry(agent_key.to_string()).or_insert((1.0, 0));
        entry.0 = ewma(entry.0, success, self.alpha);
        entry.1 += 1;
    }

    /// Current score; unseen agents score 1.0.
    pub fn score(&self, agent_key: &str) -> f64 {
        self.scores.get(agent_key).map_or(1.0, |e| e.0)
    }

    /// Current status.
    pub fn status(&self, agent_key: &str) -> HealthStatus {
        HealthStatus::from_score(self.score(agent_key))
    }

    /// Every tracked agent, sorted by key.
    pub fn snapshot(&self) -> BTreeMap<String, AgentHealth> {
        self.scores
            .iter()
            .map(|e| {
                let (score, observations) = *e.value();
                (
                    e.key().clone(),
                    AgentHealth {
                        score,
                        status: HealthStatus::from_score(score),
                        observations,
                    },
                )
            })
            .collect()
    }
}

impl Default for AgentHealthBoard {
    fn default() -> Self {
        Self::new(0.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewma_formula() {
        let s = ewma(1.0, false, 0.5);
        assert!((s - 0.5).abs() < 1e-9);
        let s = ewma(s, false, 0.5);
        assert!((s - 0.25).abs() < 1e-9);
        let s = ewma(s, true, 0.5);
        assert!((s - 0.625).abs() < 1e-9);
    }

    #[test]
    fn test_board_degrades_and_recovers() {
        let board = AgentHealthBoard::new(0.5);
        assert_eq!(board.status("external/reviewer"), HealthStatus::Healthy);
        board.observe("external/reviewer", false);
        assert_eq!(board.status("external/reviewer"), HealthStatus::Degraded);
        board.observe("external/reviewer", false);
        assert_eq!(board.status("external/reviewer"), HealthStatus::Unreachable);
        for _ in 0..6 {
            board.observe("external/reviewer", true);
        }
        assert_eq!(board.status("external/reviewer"), HealthStatus::Healthy);
        assert_eq!(board.snapshot()["external/reviewer"].observations, 8);
    }
}
