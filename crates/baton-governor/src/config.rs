use baton_core::{BatonError, BatonResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits and health settings for one governed endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint name, used as the routing key.
    pub name: String,
    /// Maximum simultaneous in-flight calls.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Requests allowed per `interval_ms`. Zero disables rate limiting.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Rate limit window in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Maximum callers waiting for admission.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Smoothing factor of the health score, in `(0, 1]`.
    #[serde(default = "default_health_alpha")]
    pub health_alpha: f64,
    /// Base URL of an HTTP tool endpoint, when the endpoint is a remote tool.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_max_concurrency() -> usize {
    10
}
fn default_max_requests() -> u32 {
    100
}
fn default_interval_ms() -> u64 {
    1_000
}
fn default_queue_depth() -> usize {
    50
}
fn default_health_alpha() -> f64 {
    0.2
}

impl EndpointConfig {
    /// Config with default limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_concurrency: default_max_concurrency(),
            max_requests: default_max_requests(),
            interval_ms: default_interval_ms(),
            queue_depth: default_queue_depth(),
            health_alpha: default_health_alpha(),
            url: None,
        }
    }

    /// Sets concurrency and queue depth.
    pub fn with_limits(mut self, max_concurrency: usize, queue_depth: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self.queue_depth = queue_depth;
        self
    }

    /// Sets the request rate.
    pub fn with_rate(mut self, max_requests: u32, interval: Duration) -> Self {
        self.max_requests = max_requests;
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the health smoothing factor.
    pub fn with_health_alpha(mut self, alpha: f64) -> Self {
        self.health_alpha = alpha;
        self
    }

    /// Sets the remote tool URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Rejects configurations the governor cannot enforce.
    pub fn validate(&self) -> BatonResult<()> {
        if self.name.trim().is_empty() {
            return Err(BatonError::Config("endpoint name must not be empty".into()));
        }
        if self.max_concurrency == 0 {
            return Err(BatonError::Config(format!(
                "endpoint '{}': max_concurrency must be at least 1",
                self.name
            )));
        }
        if self.max_requests > 0 && self.interval_ms == 0 {
            return Err(BatonError::Config(format!(
                "endpoint '{}': interval_ms must be positive when max_requests is set",
                self.name
            )));
        }
        if !(self.health_alpha > 0.0 && self.health_alpha <= 1.0) {
            return Err(BatonError::Config(format!(
                "endpoint '{}': health_alpha must be in (0, 1]",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_toml_like_json() {
        let cfg: EndpointConfig = serde_json::from_str(r#"{"name": "docs"}"#).unwrap();
        assert_eq!(cfg.max_concurrency, 10);
        assert_eq!(cfg.queue_depth, 50);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(EndpointConfig::new("a").with_limits(0, 5).validate().is_err());
        assert!(EndpointConfig::new("a")
            .with_health_alpha(0.0)
            .validate()
            .is_err());
        assert!(EndpointConfig::new("a")
            .with_rate(5, Duration::ZERO)
            .validate()
            .is_err());
        assert!(EndpointConfig::new(" ").validate().is_err());
    }
}
