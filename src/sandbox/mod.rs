//! Sandbox host supervision
//!
//! The sandbox host is a long-lived subprocess owning an isolate runtime
//! with no ambient filesystem or network. It exposes a single POST endpoint
//! accepting `{workerId, workerProgram, executionRequest}` and returns the
//! worker's structured response verbatim. The supervisor owns the child,
//! polls it to readiness, and terminates its whole process group on
//! shutdown.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::codegen::{WorkerProgram, WorkerResponse};
use crate::config::SandboxHostConfig;
use crate::process::{self, ProcessRegistry};
use crate::{Error, Result};

/// Markers in host stderr that identify a worker build failure, so the
/// caller can surface a compilation problem instead of a generic one.
const BUILD_FAILURE_MARKERS: &[&str] = &["build failed", "error during build"];

/// Cap on captured host output retained for diagnostics
const CAPTURE_CAP: usize = 64 * 1024;

/// Extra wall-clock allowance on top of the execution timeout for the
/// request to the host (program upload, isolate start, response framing)
const REQUEST_GRACE: Duration = Duration::from_secs(10);

/// Supervised sandbox host subprocess
#[derive(Debug)]
pub struct SandboxHost {
    config: SandboxHostConfig,
    client: reqwest::Client,
    base_url: String,
    pid: AtomicU64,
    running: AtomicBool,
    stderr_capture: Arc<Mutex<String>>,
    stdout_capture: Arc<Mutex<String>>,
}

impl SandboxHost {
    /// Spawn the host and poll it to readiness.
    ///
    /// The child is registered with `processes` so shutdown reaches it even
    /// if this handle is lost. A nonzero exit before readiness with a build
    /// marker in stderr raises a build error; any other premature exit or a
    /// readiness timeout raises a worker error with captured output.
    pub async fn start(config: SandboxHostConfig, processes: &ProcessRegistry) -> Result<Self> {
        let base_url = format!("http://127.0.0.1:{}", config.port);
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::worker(format!("sandbox host client: {e}")))?;

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            Error::worker(format!("failed to spawn sandbox host '{}': {e}", config.command))
        })?;
        let pid = child.id().unwrap_or(0);
        processes.track(pid);

        let host = Self {
            config,
            client,
            base_url,
            pid: AtomicU64::new(u64::from(pid)),
            running: AtomicBool::new(false),
            stderr_capture: Arc::new(Mutex::new(String::new())),
            stdout_capture: Arc::new(Mutex::new(String::new())),
        };

        if let Some(stderr) = child.stderr.take() {
            spawn_capture(stderr, Arc::clone(&host.stderr_capture));
        }
        if let Some(stdout) = child.stdout.take() {
            spawn_capture(stdout, Arc::clone(&host.stdout_capture));
        }

        host.await_ready(&mut child, processes).await?;

        // The child handle is dropped here; the registry keeps the PID and
        // close() signals the group directly.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(host)
    }

    /// Poll until the host accepts a trivial request, bounded by both the
    /// attempt count and the wall-clock deadline.
    async fn await_ready(
        &self,
        child: &mut tokio::process::Child,
        processes: &ProcessRegistry,
    ) -> Result<()> {
        let started = Instant::now();
        for attempt in 0..self.config.ready_poll_attempts {
            if started.elapsed() > self.config.ready_deadline {
                break;
            }

            if let Ok(Some(status)) = child.try_wait() {
                processes.untrack(self.pid());
                let stderr = self.stderr_capture.lock().clone();
                if !status.success() && has_build_marker(&stderr) {
                    return Err(Error::Build(stderr));
                }
                let mut details = std::collections::HashMap::new();
                details.insert("stderr".to_string(), stderr);
                details.insert("stdout".to_string(), self.stdout_capture.lock().clone());
                details.insert("port".to_string(), self.config.port.to_string());
                return Err(Error::worker_with_details(
                    format!("sandbox host exited before readiness: {status}"),
                    details,
                ));
            }

            if self.client.get(&self.base_url).send().await.is_ok() {
                self.running.store(true, Ordering::Relaxed);
                info!(url = %self.base_url, attempt, "Sandbox host ready");
                return Ok(());
            }

            tokio::time::sleep(self.config.ready_poll_interval).await;
        }

        // Give up: reap the child before reporting.
        processes.untrack(self.pid());
        process::terminate_group(self.pid()).await;
        let mut details = std::collections::HashMap::new();
        details.insert("stderr".to_string(), self.stderr_capture.lock().clone());
        details.insert("port".to_string(), self.config.port.to_string());
        Err(Error::worker_with_details(
            format!(
                "sandbox host not ready after {} polls / {:?}",
                self.config.ready_poll_attempts, self.config.ready_deadline
            ),
            details,
        ))
    }

    /// Whether the host reached readiness and has not been shut down
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// The host's base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn pid(&self) -> u32 {
        u32::try_from(self.pid.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Run one worker program.
    ///
    /// The request carries the execution timeout for the in-worker promise
    /// race; the HTTP request itself gets a supervisory allowance on top so
    /// a wedged isolate cannot hang the supervisor.
    pub async fn execute(
        &self,
        worker_id: &str,
        program: &WorkerProgram,
        code: &str,
        timeout: Duration,
    ) -> Result<WorkerResponse> {
        if !self.is_running() {
            return Err(Error::worker("sandbox host is not running"));
        }

        let payload = json!({
            "workerId": worker_id,
            "workerProgram": program,
            "executionRequest": {
                "code": code,
                "timeout": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
        });

        debug!(worker_id, "Dispatching execution to sandbox host");
        let response = self
            .client
            .post(format!("{}/", self.base_url))
            .timeout(timeout + REQUEST_GRACE)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::worker(format!("sandbox host unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let code = body
                .get("error")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("HOST_ERROR")
                .to_string();
            let message = body
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("sandbox host reported a failure")
                .to_string();
            return Err(Error::sandbox(code, message, Some(status.as_u16())));
        }

        response
            .json::<WorkerResponse>()
            .await
            .map_err(|e| Error::sandbox("BAD_RESPONSE", format!("unparseable worker response: {e}"), None))
    }

    /// Terminate the host's process group
    pub async fn shutdown(&self, processes: &ProcessRegistry) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        let pid = self.pid();
        if pid != 0 {
            warn!(pid, "Terminating sandbox host");
            processes.untrack(pid);
            process::terminate_group(pid).await;
        }
    }
}

/// Append a child stream to a capped capture buffer
fn spawn_capture<R>(stream: R, buffer: Arc<Mutex<String>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut captured = buffer.lock();
            if captured.len() < CAPTURE_CAP {
                captured.push_str(&line);
                captured.push('\n');
            }
        }
    });
}

/// Whether captured stderr carries a build-failure marker
fn has_build_marker(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    BUILD_FAILURE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
