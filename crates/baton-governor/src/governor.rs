use crate::bucket::TokenBucket;
use crate::config::EndpointConfig;
use crate::health::ewma;
use crate::tool::{ToolEndpoint, ToolRequest};
use baton_core::{BatonError, BatonResult, HealthStatus, RetryPolicy};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Default)]
struct PoolCounters {
    in_flight: AtomicUsize,
    queued: AtomicUsize,
    peak_in_flight: AtomicUsize,
    peak_queued: AtomicUsize,
    admitted: AtomicU64,
    throttled: AtomicU64,
    timed_out: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

struct EndpointPool {
    config: EndpointConfig,
    slots: Arc<Semaphore>,
    /// Fair mutex: waiters are admitted in the order they called `lock`.
    gate: AsyncMutex<()>,
    bucket: Option<parking_lot::Mutex<TokenBucket>>,
    health: parking_lot::Mutex<f64>,
    counters: PoolCounters,
}

impl EndpointPool {
    fn new(config: EndpointConfig) -> Self {
        let bucket = TokenBucket::new(config.max_requests, Duration::from_millis(config.interval_ms))
            .map(parking_lot::Mutex::new);
        Self {
            slots: Arc::new(Semaphore::new(config.max_concurrency)),
            gate: AsyncMutex::new(()),
            bucket,
            health: parking_lot::Mutex::new(1.0),
            counters: PoolCounters::default(),
            config,
        }
    }

    fn try_token(&self) -> Result<(), Duration> {
        match &self.bucket {
            Some(bucket) => bucket.lock().take(),
            None => Ok(()),
        }
    }

    async fn wait_token(&self) {
        while let Err(wait) = self.try_token() {
            tokio::time::sleep(wait).await;
        }
    }

    fn record(&self, success: bool) {
        let mut health = self.health.lock();
        *health = ewma(*health, success, self.config.health_alpha);
        if success {
            self.counters.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn health(&self) -> f64 {
        *self.health.lock()
    }
}

/// Releases a reserved queue position when dropped.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An admitted call. Dropping it releases the connection slot.
///
/// Report the outcome with [`EndpointPermit::succeed`] or
/// [`EndpointPermit::fail`]; a permit dropped without a report leaves the
/// health score untouched.
pub struct EndpointPermit {
    pool: Arc<EndpointPool>,
    _slot: OwnedSemaphorePermit,
}

impl EndpointPermit {
    fn new(pool: Arc<EndpointPool>, slot: OwnedSemaphorePermit) -> Self {
        let in_flight = pool.counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        pool.counters
            .peak_in_flight
            .fetch_max(in_flight, Ordering::AcqRel);
        pool.counters.admitted.fetch_add(1, Ordering::Relaxed);
        Self { pool, _slot: slot }
    }

    /// Endpoint this permit belongs to.
    pub fn endpoint(&self) -> &str {
        &self.pool.config.name
    }

    /// Records a successful call and releases the slot.
    pub fn succeed(self) {
        self.pool.record(true);
    }

    /// Records a failed call and releases the slot.
    pub fn fail(self) {
        self.pool.record(false);
    }
}

impl Drop for EndpointPermit {
    fn drop(&mut self) {
        self.pool.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time statistics of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    /// Endpoint name.
    pub name: String,
    /// Configured concurrency limit.
    pub max_concurrency: usize,
    /// Configured queue depth.
    pub queue_depth: usize,
    /// Calls currently holding a slot.
    pub in_flight: usize,
    /// Callers currently waiting.
    pub queued: usize,
    /// Highest in-flight count observed.
    pub peak_in_flight: usize,
    /// Highest queue length observed.
    pub peak_queued: usize,
    /// Calls admitted.
    pub admitted: u64,
    /// Calls rejected because the queue was full.
    pub throttled: u64,
    /// Callers whose wait timed out.
    pub timed_out: u64,
    /// Reported successes.
    pub successes: u64,
    /// Reported failures.
    pub failures: u64,
    /// Smoothed success ratio.
    pub health: f64,
    /// Derived status.
    pub status: HealthStatus,
}

/// Connection & rate governor.
///
/// Each endpoint has its own concurrency pool, bounded FIFO wait queue and
/// token bucket. Callers that find the queue full get
/// [`BatonError::Throttled`] immediately.
pub struct ConnectionGovernor {
    pools: DashMap<String, Arc<EndpointPool>>,
    tools: DashMap<String, Arc<dyn ToolEndpoint>>,
}

impl ConnectionGovernor {
    /// Creates a governor with the given endpoints.
    pub fn new(configs: impl IntoIterator<Item = EndpointConfig>) -> BatonResult<Self> {
        let governor = Self {
            pools: DashMap::new(),
            tools: DashMap::new(),
        };
        for config in configs {
            governor.add_endpoint(config)?;
        }
        Ok(governor)
    }

    /// Adds an endpoint. Names must be unique.
    pub fn add_endpoint(&self, config: EndpointConfig) -> BatonResult<()> {
        config.validate()?;
        if self.pools.contains_key(&config.name) {
            return Err(BatonError::Config(format!(
                "endpoint '{}' configured twice",
                config.name
            )));
        }
        info!(
            endpoint = %config.name,
            max_concurrency = config.max_concurrency,
            queue_depth = config.queue_depth,
            max_requests = config.max_requests,
            interval_ms = config.interval_ms,
            "Governor: endpoint registered"
        );
        self.pools
            .insert(config.name.clone(), Arc::new(EndpointPool::new(config)));
        Ok(())
    }

    /// Attaches the client used by [`ConnectionGovernor::invoke`] for an
    /// endpoint.
    pub fn register_tool(
        &self,
        endpoint: impl Into<String>,
        tool: Arc<dyn ToolEndpoint>,
    ) -> BatonResult<()> {
        let endpoint = endpoint.into();
        if !self.pools.contains_key(&endpoint) {
            return Err(BatonError::UnknownEndpoint(endpoint));
        }
        self.tools.insert(endpoint, tool);
        Ok(())
    }

    /// Whether an endpoint is configured.
    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        self.pools.contains_key(endpoint)
    }

    fn pool(&self, endpoint: &str) -> BatonResult<Arc<EndpointPool>> {
        self.pools
            .get(endpoint)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| BatonError::UnknownEndpoint(endpoint.to_string()))
    }

    /// Waits for admission to `endpoint`.
    ///
    /// Admission is immediate when a slot and a token are free and nobody is
    /// queued. Otherwise the caller joins the queue if it has room and is
    /// admitted strictly in arrival order; a full queue yields `Throttled`.
    /// `timeout` bounds the time spent queued.
    pub async fn acquire(&self, endpoint: &str, timeout: Duration) -> BatonResult<EndpointPermit> {
        let pool = self.pool(endpoint)?;

        if pool.counters.queued.load(Ordering::Acquire) == 0 {
            if let Ok(_gate) = pool.gate.try_lock() {
                if let Ok(slot) = Arc::clone(&pool.slots).try_acquire_owned() {
                    if pool.try_token().is_ok() {
                        return Ok(EndpointPermit::new(pool.clone(), slot));
                    }
                }
            }
        }

        let counters = &pool.counters;
        let reserved = counters
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| {
                (q < pool.config.queue_depth).then_some(q + 1)
            });
        let position = match reserved {
            Ok(previous) => previous + 1,
            Err(_) => {
                counters.throttled.fetch_add(1, Ordering::Relaxed);
                debug!(endpoint = %endpoint, "Governor: queue full, throttled");
                return Err(BatonError::Throttled {
                    endpoint: endpoint.to_string(),
                });
            }
        };
        let queue_slot = QueueSlot(&counters.queued);
        counters.peak_queued.fetch_max(position, Ordering::AcqRel);

        let admission = async {
            let _gate = pool.gate.lock().await;
            let slot = Arc::clone(&pool.slots)
                .acquire_owned()
                .await
                .map_err(|_| BatonError::Config(format!("endpoint '{endpoint}' pool closed")))?;
            pool.wait_token().await;
            Ok::<_, BatonError>(slot)
        };

        let slot = match tokio::time::timeout(timeout, admission).await {
            Ok(result) => result?,
            Err(_) => {
                counters.timed_out.fetch_add(1, Ordering::Relaxed);
                debug!(endpoint = %endpoint, "Governor: timed out while queued");
                return Err(BatonError::Timeout(format!(
                    "waiting for endpoint '{endpoint}'"
                )));
            }
        };
        drop(queue_slot);
        Ok(EndpointPermit::new(pool.clone(), slot))
    }

    /// Acquires a permit, runs `f`, and reports its outcome. `timeout`
    /// bounds queueing and execution together.
    pub async fn call<T, F, Fut>(&self, endpoint: &str, timeout: Duration, f: F) -> BatonResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BatonResult<T>>,
    {
        let deadline = Instant::now() + timeout;
        let permit = self.acquire(endpoint, timeout).await?;
        match tokio::time::timeout_at(deadline, f()).await {
            Ok(Ok(value)) => {
                permit.succeed();
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.fail();
                Err(e)
            }
            Err(_) => {
                permit.fail();
                Err(BatonError::Timeout(format!("call to endpoint '{endpoint}'")))
            }
        }
    }

    /// Invokes a tool through its registered client under the endpoint's
    /// limits.
    pub async fn invoke(
        &self,
        request: &ToolRequest,
        timeout: Duration,
    ) -> BatonResult<serde_json::Value> {
        let tool = self
            .tools
            .get(&request.endpoint)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| BatonError::UnknownEndpoint(request.endpoint.clone()))?;
        self.call(&request.endpoint, timeout, || async move {
            tool.invoke(request).await
        })
        .await
    }

    /// [`ConnectionGovernor::invoke`] with transient failures, including
    /// `Throttled`, retried under `policy`.
    pub async fn invoke_with_retry(
        &self,
        request: &ToolRequest,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> BatonResult<serde_json::Value> {
        let label = format!("invoke {}/{}", request.endpoint, request.operation);
        let result = policy
            .run(&label, |_| self.invoke(request, timeout))
            .await;
        if let Err(e) = &result {
            warn!(endpoint = %request.endpoint, error = %e, "Governor: invoke failed");
        }
        result
    }

    /// Smoothed success ratio of an endpoint.
    pub fn health(&self, endpoint: &str) -> BatonResult<f64> {
        Ok(self.pool(endpoint)?.health())
    }

    /// Health status of an endpoint.
    pub fn status(&self, endpoint: &str) -> BatonResult<HealthStatus> {
        self.health(endpoint).map(HealthStatus::from_score)
    }

    /// Statistics for every endpoint, sorted by name.
    pub fn stats(&self) -> Vec<EndpointStats> {
        let mut stats: Vec<EndpointStats> = self
            .pools
            .iter()
            .map(|entry| {
                let pool = entry.value();
                let c = &pool.counters;
                let health = pool.health();
                EndpointStats {
                    name: pool.config.name.clone(),
                    max_concurrency: pool.config.max_concurrency,
                    queue_depth: pool.config.queue_depth,
                    in_flight: c.in_flight.load(Ordering::Acquire),
                    queued: c.queued.load(Ordering::Acquire),
                    peak_in_flight: c.peak_in_flight.load(Ordering::Acquire),
                    peak_queued: c.peak_queued.load(Ordering::Acquire),
                    admitted: c.admitted.load(Ordering::Relaxed),
                    throttled: c.throttled.load(Ordering::Relaxed),
                    timed_out: c.timed_out.load(Ordering::Relaxed),
                    successes: c.successes.load(Ordering::Relaxed),
                    failures: c.failures.load(Ordering::Relaxed),
                    health,
                    status: HealthStatus::from_score(health),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Statistics for one endpoint.
    pub fn endpoint_stats(&self, endpoint: &str) -> BatonResult<EndpointStats> {
        self.pool(endpoint)?;
        self.stats()
            .into_iter()
            .find(|s| s.name == endpoint)
            .ok_or_else(|| BatonError::UnknownEndpoint(endpoint.to_string()))
    }
}
