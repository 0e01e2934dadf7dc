use async_trait::async_trait;
use baton_core::{BatonError, BatonResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request / report
// ---------------------------------------------------------------------------

/// Resource bounds applied to one sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Address-space ceiling in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    /// CPU time ceiling in seconds.
    #[serde(default = "default_cpu_secs")]
    pub cpu_secs: u64,
    /// Wall-clock ceiling in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Allow outbound network access.
    #[serde(default)]
    pub network: bool,
    /// Bytes of stdout and stderr kept each.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_memory_mb() -> u64 {
    512
}
fn default_cpu_secs() -> u64 {
    10
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_output_bytes() -> usize {
    64 * 1024
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_mb: default_memory_mb(),
            cpu_secs: default_cpu_secs(),
            timeout_ms: default_timeout_ms(),
            network: false,
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

/// A file made available, read-only, to the sandboxed program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInput {
    /// File name inside the input directory.
    pub name: String,
    /// Content.
    pub content: Vec<u8>,
}

/// One program run.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Task the run belongs to.
    pub task_id: Uuid,
    /// Program and arguments, resolved relative to the input directory.
    pub command: Vec<String>,
    /// Input files.
    pub inputs: Vec<SandboxInput>,
    /// Resource bounds.
    pub limits: SandboxLimits,
}

/// Outcome of a run that exited on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxReport {
    /// Exit code.
    pub exit_code: i64,
    /// Captured standard output, truncated to the limit.
    pub stdout: String,
    /// Captured standard error, truncated to the limit.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl SandboxReport {
    /// Whether the program exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Isolated, resource-bounded program execution.
///
/// Crashes, timeouts and resource kills are `SandboxFault` errors. A program
/// that exits on its own, with any status, yields a report. Every resource a
/// run creates is released before `execute` returns, on every path.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Backend name for logs and reports.
    fn name(&self) -> &str;

    /// Runs the request to completion, timeout or cancellation.
    async fn execute(
        &self,
        request: &SandboxRequest,
        cancel: &CancellationToken,
    ) -> BatonResult<SandboxReport>;
}

/// Rejects empty commands and names that would escape the input directory.
pub fn validate_request(request: &SandboxRequest) -> BatonResult<()> {
    match request.command.first() {
        Some(program) if !program.trim().is_empty() => {}
        _ => return Err(BatonError::SandboxFault("empty command".into())),
    }
    if request.command.iter().any(|a| a.contains('\0')) {
        return Err(BatonError::SandboxFault(
            "command contains null bytes".into(),
        ));
    }
    for input in &request.inputs {
        let n = input.name.as_str();
        if n.is_empty() || n == "." || n == ".." || n.contains(['/', '\\', '\0']) {
            return Err(BatonError::SandboxFault(format!(
                "invalid input file name '{n}'"
            )));
        }
    }
    Ok(())
}

/// Writes the inputs into `dir` and marks each file read-only.
pub(crate) async fn stage_inputs(dir: &Path, inputs: &[SandboxInput]) -> BatonResult<()> {
    tokio::fs::create_dir_all(dir).await?;
    for input in inputs {
        let path = dir.join(&input.name);
        tokio::fs::write(&path, &input.content).await?;
        let mut perms = tokio::fs::metadata(&path).await?.permissions();
        perms.set_readonly(true);
        tokio::fs::set_permissions(&path, perms).await?;
    }
    Ok(())
}

/// Lossy UTF-8 of at most `max` bytes, with a truncation note.
pub(crate) fn truncate_output(bytes: &[u8], total: usize, max: usize) -> String {
    let kept = &bytes[..bytes.len().min(max)];
    let text = String::from_utf8_lossy(kept).into_owned();
    if total > max {
        format!("{text}... [truncated, {total} total bytes]")
    } else {
        text
    }
}

// ---------------------------------------------------------------------------
// Process sandbox
// ---------------------------------------------------------------------------

/// Settings for [`ProcessSandbox`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSandboxConfig {
    /// Run inside a fresh network namespace (`unshare -rn`) unless the
    /// request allows network access.
    #[serde(default = "default_isolate_network")]
    pub isolate_network: bool,
    /// `PATH` given to the program; the rest of the environment is cleared.
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_isolate_network() -> bool {
    true
}
fn default_path() -> String {
    "/usr/local/bin:/usr/bin:/bin".to_string()
}

impl Default for ProcessSandboxConfig {
    fn default() -> Self {
        Self {
            isolate_network: default_isolate_network(),
            path: default_path(),
        }
    }
}

fn is_available(program: &str) -> bool {
    std::process::Command::new("which")
        .arg(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Scratch directory for one run. Input permissions are restored before
/// the directory is removed so removal cannot fail on read-only files.
struct Scratch {
    dir: tempfile::TempDir,
}

impl Scratch {
    fn new() -> BatonResult<Self> {
        let dir = tempfile::Builder::new().prefix("baton-sandbox-").tempdir()?;
        Ok(Self { dir })
    }

    fn input(&self) -> PathBuf {
        self.dir.path().join("input")
    }

    fn work(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    #[cfg(unix)]
    fn seal_inputs(&self) -> BatonResult<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(self.input(), std::fs::Permissions::from_mode(0o555))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn seal_inputs(&self) -> BatonResult<()> {
        Ok(())
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(self.input(), std::fs::Permissions::from_mode(0o755));
            if let Ok(entries) = std::fs::read_dir(self.input()) {
                for entry in entries.flatten() {
                    let _ = std::fs::set_permissions(
                        entry.path(),
                        std::fs::Permissions::from_mode(0o644),
                    );
                }
            }
        }
        debug!(path = %self.dir.path().display(), "Sandbox: scratch removed");
    }
}

/// Runs programs as local child processes.
///
/// Each run gets a fresh temporary directory holding the read-only inputs
/// (the working directory) and a writable scratch area (`HOME` and
/// `TMPDIR`). The environment is cleared, address space and CPU time are
/// capped with `ulimit`, and the whole process group is killed when the run
/// ends, times out or is cancelled.
pub struct ProcessSandbox {
    config: ProcessSandboxConfig,
}

impl ProcessSandbox {
    /// Creates the sandbox, checking that the required tools are installed.
    pub fn new(config: ProcessSandboxConfig) -> BatonResult<Self> {
        if !is_available("sh") {
            return Err(BatonError::Config("process sandbox needs 'sh' on PATH".into()));
        }
        if config.isolate_network && !is_available("unshare") {
            return Err(BatonError::Config(
                "network isolation needs 'unshare' (util-linux); install it or set isolate_network = false"
                    .into(),
            ));
        }
        info!(isolate_network = config.isolate_network, "Sandbox: process backend ready");
        Ok(Self { config })
    }

    fn command(&self, request: &SandboxRequest, scratch: &Scratch) -> Command {
        let limits = &request.limits;
        let script = format!(
            "ulimit -v {} && ulimit -t {} && exec \"$@\"",
            limits.memory_mb.saturating_mul(1024),
            limits.cpu_secs.max(1)
        );
        let mut argv: Vec<String> = Vec::new();
        if self.config.isolate_network && !limits.network {
            argv.extend(["unshare".into(), "-rn".into()]);
        }
        argv.extend(["sh".into(), "-c".into(), script, "baton-sandbox".into()]);
        argv.extend(request.command.iter().cloned());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env_clear()
            .env("PATH", &self.config.path)
            .env("HOME", scratch.work())
            .env("TMPDIR", scratch.work())
            .env("LANG", "C.UTF-8")
            .current_dir(scratch.input())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, max: usize) -> (Vec<u8>, usize) {
    let mut kept = Vec::new();
    let mut total = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total += n;
                if kept.len() < max {
                    let take = n.min(max - kept.len());
                    kept.extend_from_slice(&buf[..take]);
                }
            }
        }
    }
    (kept, total)
}

/// Kills the process group led by `pid`, then the child itself.
///
/// The pid is taken at spawn time: once the child has been reaped
/// `Child::id` is gone, but the group lives on while any member does.
async fn kill_group(pid: Option<u32>, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        let _ = Command::new("kill")
            .args(["-KILL", "--", &format!("-{pid}")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
    let _ = child.kill().await;
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(
        &self,
        request: &SandboxRequest,
        cancel: &CancellationToken,
    ) -> BatonResult<SandboxReport> {
        validate_request(request)?;
        let scratch = Scratch::new()?;
        stage_inputs(&scratch.input(), &request.inputs).await?;
        tokio::fs::create_dir_all(scratch.work()).await?;
        scratch.seal_inputs()?;

        let started = Instant::now();
        let max = request.limits.max_output_bytes;
        let mut child = self
            .command(request, &scratch)
            .spawn()
            .map_err(|e| BatonError::SandboxFault(format!("failed to spawn: {e}")))?;
        let pid = child.id();
        let stdout = child.stdout.take().map(|r| tokio::spawn(read_capped(r, max)));
        let stderr = child.stderr.take().map(|r| tokio::spawn(read_capped(r, max)));

        let timeout = Duration::from_millis(request.limits.timeout_ms);
        let waited = tokio::select! {
            res = child.wait() => Ok(res),
            _ = tokio::time::sleep(timeout) => Err(BatonError::SandboxFault(format!(
                "timed out after {}ms",
                request.limits.timeout_ms
            ))),
            _ = cancel.cancelled() => Err(BatonError::Cancelled(format!(
                "sandbox run for task {}",
                request.task_id
            ))),
        };
        // Leftover background processes go down with the group on every path.
        kill_group(pid, &mut child).await;

        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                abort_readers(stdout, stderr);
                return Err(BatonError::SandboxFault(format!("wait failed: {e}")));
            }
            Err(e) => {
                abort_readers(stdout, stderr);
                warn!(task_id = %request.task_id, error = %e, "Sandbox: run aborted");
                return Err(e);
            }
        };

        let (out, out_total) = join_reader(stdout).await;
        let (err, err_total) = join_reader(stderr).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let Some(exit_code) = status.code() else {
            return Err(BatonError::SandboxFault(format!(
                "terminated by a signal after {duration_ms}ms: {}",
                truncate_output(&err, err_total, 512)
            )));
        };
        debug!(
            task_id = %request.task_id,
            exit_code,
            duration_ms,
            "Sandbox: process exited"
        );
        Ok(SandboxReport {
            exit_code: i64::from(exit_code),
            stdout: truncate_output(&out, out_total, max),
            stderr: truncate_output(&err, err_total, max),
            duration_ms,
        })
    }
}

type Reader = Option<tokio::task::JoinHandle<(Vec<u8>, usize)>>;

fn abort_readers(stdout: Reader, stderr: Reader) {
    for handle in [stdout, stderr].into_iter().flatten() {
        handle.abort();
    }
}

async fn join_reader(reader: Reader) -> (Vec<u8>, usize) {
    match reader {
        Some(handle) => match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(output)) => output,
            _ => (Vec::new(), 0),
        },
        None => (Vec::new(), 0),
    }
}
