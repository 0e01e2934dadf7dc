//! Zombie reaper.
//!
//! `pending` and `accepted` tasks that outlive their deadline are
//! force-failed with reason `expired`. An `in_progress` task is judged only
//! against the in-progress ceiling, measured from when it started, so a
//! task that begins shortly before its TTL runs out still gets to finish.
//! The same loop archives old terminal tasks and prunes stale sessions.

use baton_core::{BatonResult, FailureReason, Task, TaskError, TaskState};
use baton_ledger::{SessionStore, TaskFilter, TaskLedger};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reaper tuning (`[reaper]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Longest a task may stay `in_progress`, measured from when it entered
    /// that state.
    #[serde(default = "default_in_progress_ceiling_secs")]
    pub in_progress_ceiling_secs: u64,
    /// Terminal tasks older than this move to the archive.
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,
    /// Sessions idle longer than this are pruned.
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,
}

fn default_interval_secs() -> u64 {
    1200
}
fn default_in_progress_ceiling_secs() -> u64 {
    3600
}
fn default_task_retention_secs() -> u64 {
    86_400
}
fn default_session_retention_secs() -> u64 {
    7 * 86_400
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            in_progress_ceiling_secs: default_in_progress_ceiling_secs(),
            task_retention_secs: default_task_retention_secs(),
            session_retention_secs: default_session_retention_secs(),
        }
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    /// When the sweep started.
    pub started_at: Option<DateTime<Utc>>,
    /// Tasks expired, keyed by the state they were stuck in.
    pub expired: BTreeMap<String, usize>,
    /// Candidates that changed state before they could be expired.
    pub skipped: usize,
    /// Sweep duration.
    pub duration_ms: u64,
}

impl SweepStats {
    /// Total tasks expired.
    pub fn total_expired(&self) -> usize {
        self.expired.values().sum()
    }
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionStats {
    /// Terminal tasks moved to the archive.
    pub archived: usize,
    /// Sessions removed.
    pub sessions_pruned: usize,
}

/// Lifetime counters of the reaper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReaperMetricsSnapshot {
    /// Sweeps run.
    pub sweeps: u64,
    /// Tasks expired.
    pub expired: u64,
    /// Candidates skipped.
    pub skipped: u64,
    /// Tasks archived.
    pub archived: u64,
    /// Sessions pruned.
    pub sessions_pruned: u64,
    /// The most recent sweep.
    pub last_sweep: Option<SweepStats>,
}

/// Periodic expiry of stuck tasks.
pub struct ZombieReaper {
    ledger: Arc<TaskLedger>,
    sessions: Arc<dyn SessionStore>,
    config: ReaperConfig,
    sweeps: AtomicU64,
    expired: AtomicU64,
    skipped: AtomicU64,
    archived: AtomicU64,
    sessions_pruned: AtomicU64,
    last_sweep: Mutex<Option<SweepStats>>,
}

impl ZombieReaper {
    /// Creates a reaper over `ledger` and `sessions`.
    pub fn new(ledger: Arc<TaskLedger>, sessions: Arc<dyn SessionStore>, config: ReaperConfig) -> Self {
        Self {
            ledger,
            sessions,
            config,
            sweeps: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            archived: AtomicU64::new(0),
            sessions_pruned: AtomicU64::new(0),
            last_sweep: Mutex::new(None),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    fn expiry_cause(&self, task: &Task, now: DateTime<Utc>) -> Option<&'static str> {
        match task.state {
            TaskState::Pending | TaskState::Accepted if task.is_past_deadline(now) => {
                Some("deadline")
            }
            TaskState::InProgress
                if now - task.updated_at > seconds(self.config.in_progress_ceiling_secs) =>
            {
                Some("in_progress_ceiling")
            }
            _ => None,
        }
    }

    /// Expires `pending`/`accepted` tasks past their deadline and
    /// `in_progress` tasks past the in-progress ceiling.
    ///
    /// Running it twice in a row expires nothing the second time.
    pub fn sweep(&self) -> SweepStats {
        let clock = Instant::now();
        let now = Utc::now();
        let mut stats = SweepStats {
            started_at: Some(now),
            ..SweepStats::default()
        };

        let candidates = self.ledger.query(&TaskFilter::in_states([
            TaskState::Pending,
            TaskState::Accepted,
            TaskState::InProgress,
        ]));
        for task in candidates {
            let Some(cause) = self.expiry_cause(&task, now) else {
                continue;
            };
            let error = TaskError::new(
                FailureReason::Expired,
                format!("task expired while {} ({cause})", task.state),
            )
            .with_details(serde_json::json!({
                "prior_state": task.state,
                "cause": cause,
                "deadline": task.deadline,
                "age_secs": task.age(now).num_seconds(),
            }));
            match self.ledger.force_fail(task.id, task.state, error) {
                Ok(_) => {
                    warn!(
                        task_id = %task.id,
                        prior_state = %task.state,
                        to_agent = %task.to_agent,
                        cause,
                        "Reaper: task expired"
                    );
                    *stats.expired.entry(task.state.as_str().to_string()).or_default() += 1;
                }
                Err(e) => {
                    debug!(task_id = %task.id, error = %e, "Reaper: task moved on, skipped");
                    stats.skipped += 1;
                }
            }
        }

        stats.duration_ms = clock.elapsed().as_millis() as u64;
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.expired
            .fetch_add(stats.total_expired() as u64, Ordering::Relaxed);
        self.skipped.fetch_add(stats.skipped as u64, Ordering::Relaxed);
        info!(
            expired = stats.total_expired(),
            skipped = stats.skipped,
            duration_ms = stats.duration_ms,
            "Reaper: sweep complete"
        );
        *self.last_sweep.lock() = Some(stats.clone());
        stats
    }

    /// Archives old terminal tasks and prunes idle sessions.
    pub async fn sweep_retention(&self) -> BatonResult<RetentionStats> {
        let archived = self
            .ledger
            .archive_terminal(seconds(self.config.task_retention_secs));
        let cutoff = Utc::now() - seconds(self.config.session_retention_secs);
        let sessions_pruned = self.sessions.prune(cutoff).await?;

        self.archived.fetch_add(archived as u64, Ordering::Relaxed);
        self.sessions_pruned
            .fetch_add(sessions_pruned as u64, Ordering::Relaxed);
        if archived > 0 || sessions_pruned > 0 {
            info!(archived, sessions_pruned, "Reaper: retention applied");
        }
        Ok(RetentionStats {
            archived,
            sessions_pruned,
        })
    }

    /// The most recent sweep.
    pub fn last_sweep(&self) -> Option<SweepStats> {
        self.last_sweep.lock().clone()
    }

    /// Lifetime counters.
    pub fn metrics(&self) -> ReaperMetricsSnapshot {
        ReaperMetricsSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            archived: self.archived.load(Ordering::Relaxed),
            sessions_pruned: self.sessions_pruned.load(Ordering::Relaxed),
            last_sweep: self.last_sweep(),
        }
    }

    /// Sweeps every `interval_secs` until `cancel` fires. The first sweep
    /// runs immediately.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.config.interval_secs, "Reaper: loop started");
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep();
                    if let Err(e) = self.sweep_retention().await {
                        warn!(error = %e, "Reaper: retention pass failed");
                    }
                }
            }
        }
        info!("Reaper: loop stopped");
    }
}
