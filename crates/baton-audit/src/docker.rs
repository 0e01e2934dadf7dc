//! Container sandbox backend.
//!
//! Each run gets its own container: memory and CPU quota from the request
//! limits, no network unless the request allows it, inputs bind-mounted
//! read-only at `/input` (the working directory) and a tmpfs at `/scratch`.
//! The container is force-removed on every exit path.
//!
//! Needs the `docker` feature and a reachable Docker daemon.

use crate::sandbox::{
    stage_inputs, truncate_output, validate_request, Sandbox, SandboxReport, SandboxRequest,
};
use async_trait::async_trait;
use baton_core::{BatonError, BatonResult};
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings for [`DockerSandbox`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerSandboxConfig {
    /// Image every run starts from.
    #[serde(default = "default_image")]
    pub image: String,
    /// CPU cores granted to the container.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    /// Size of the `/scratch` tmpfs in megabytes.
    #[serde(default = "default_scratch_mb")]
    pub scratch_mb: u64,
    /// Process count ceiling inside the container.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

fn default_image() -> String {
    "ubuntu:22.04".to_string()
}
fn default_cpu_limit() -> f64 {
    1.0
}
fn default_scratch_mb() -> u64 {
    64
}
fn default_pids_limit() -> i64 {
    256
}

impl Default for DockerSandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            cpu_limit: default_cpu_limit(),
            scratch_mb: default_scratch_mb(),
            pids_limit: default_pids_limit(),
        }
    }
}

/// Runs programs in throwaway Docker containers.
pub struct DockerSandbox {
    config: DockerSandboxConfig,
    client: Docker,
}

fn docker_err(context: &str, e: bollard::errors::Error) -> BatonError {
    BatonError::SandboxFault(format!("{context}: {e}"))
}

impl DockerSandbox {
    /// Connects to the local daemon and checks it answers.
    pub async fn new(config: DockerSandboxConfig) -> BatonResult<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| BatonError::Config(format!("failed to connect to Docker: {e}")))?;
        client
            .ping()
            .await
            .map_err(|e| BatonError::Config(format!("Docker daemon ping failed: {e}")))?;
        info!(image = %config.image, "Sandbox: docker backend ready");
        Ok(Self { config, client })
    }

    fn container_config(&self, request: &SandboxRequest, input_dir: &str) -> ContainerConfig<String> {
        let limits = &request.limits;
        let host_config = HostConfig {
            memory: Some((limits.memory_mb * 1024 * 1024) as i64),
            cpu_period: Some(100_000),
            cpu_quota: Some((100_000.0 * self.config.cpu_limit) as i64),
            pids_limit: Some(self.config.pids_limit),
            network_mode: if limits.network {
                None
            } else {
                Some("none".to_string())
            },
            binds: Some(vec![format!("{input_dir}:/input:ro")]),
            tmpfs: Some(HashMap::from([(
                "/scratch".to_string(),
                format!("rw,size={}m", self.config.scratch_mb),
            )])),
            readonly_rootfs: Some(true),
            ..Default::default()
        };
        ContainerConfig {
            image: Some(self.config.image.clone()),
            cmd: Some(request.command.clone()),
            working_dir: Some("/input".to_string()),
            env: Some(vec![
                "HOME=/scratch".to_string(),
                "TMPDIR=/scratch".to_string(),
            ]),
            network_disabled: Some(!limits.network),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn run(
        &self,
        id: &str,
        request: &SandboxRequest,
        cancel: &CancellationToken,
    ) -> BatonResult<SandboxReport> {
        let started = Instant::now();
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| docker_err("failed to start container", e))?;

        let mut wait = Box::pin(self.client.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        ));
        let timeout = Duration::from_millis(request.limits.timeout_ms);
        let exit_code = tokio::select! {
            next = wait.next() => match next {
                Some(Ok(resp)) => resp.status_code,
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => return Err(docker_err("wait failed", e)),
                None => return Err(BatonError::SandboxFault("container wait stream ended".into())),
            },
            _ = tokio::time::sleep(timeout) => {
                return Err(BatonError::SandboxFault(format!(
                    "timed out after {}ms",
                    request.limits.timeout_ms
                )));
            }
            _ = cancel.cancelled() => {
                return Err(BatonError::Cancelled(format!(
                    "sandbox run for task {}",
                    request.task_id
                )));
            }
        };

        let max = request.limits.max_output_bytes;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut logs = Box::pin(self.client.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        ));
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                Ok(_) => {}
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Sandbox: log stream error");
                    break;
                }
            }
        }

        // 137 is the conventional status of a SIGKILL, which is how the OOM
        // killer ends a container.
        if exit_code == 137 {
            return Err(BatonError::SandboxFault(
                "container killed (memory limit or signal)".into(),
            ));
        }
        Ok(SandboxReport {
            exit_code,
            stdout: truncate_output(&stdout, stdout.len(), max),
            stderr: truncate_output(&stderr, stderr.len(), max),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn remove(&self, id: &str) {
        let removed = self
            .client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;
        match removed {
            Ok(()) => debug!(container_id = %id, "Sandbox: container removed"),
            Err(e) => warn!(container_id = %id, error = %e, "Sandbox: container removal failed"),
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &str {
        "docker"
    }

    async fn execute(
        &self,
        request: &SandboxRequest,
        cancel: &CancellationToken,
    ) -> BatonResult<SandboxReport> {
        validate_request(request)?;
        let host = tempfile::Builder::new().prefix("baton-docker-").tempdir()?;
        stage_inputs(host.path(), &request.inputs).await?;
        let input_dir = host.path().to_string_lossy().into_owned();

        let name = format!("baton-audit-{}", uuid::Uuid::new_v4());
        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                self.container_config(request, &input_dir),
            )
            .await
            .map_err(|e| docker_err("failed to create container", e))?;

        let outcome = self.run(&created.id, request, cancel).await;
        self.remove(&created.id).await;
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: DockerSandboxConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DockerSandboxConfig::default());
        assert_eq!(config.image, "ubuntu:22.04");
        assert_eq!(config.pids_limit, 256);
    }
}
