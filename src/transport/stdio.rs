//! Stdio transport (subprocess providers)

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error};

use super::Transport;
use crate::process;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId};
use crate::{Error, Result};

/// Stdio transport for subprocess providers.
///
/// The transport owns the child; `close` terminates the entire process
/// group so grandchildren do not outlive an unload.
pub struct StdioTransport {
    /// Child process
    child: Mutex<Option<Child>>,
    /// Child PID, retained after the handle is consumed
    pid: AtomicU64,
    /// Pending requests waiting for a response line
    pending: dashmap::DashMap<String, oneshot::Sender<JsonRpcResponse>>,
    /// Request ID counter
    request_id: AtomicU64,
    /// Connected flag
    connected: AtomicBool,
    /// Program to execute
    program: String,
    /// Arguments
    args: Vec<String>,
    /// Environment overlay
    env: HashMap<String, String>,
    /// Writer handle
    writer: Mutex<Option<tokio::process::ChildStdin>>,
}

impl StdioTransport {
    /// Create a new stdio transport for an already-resolved command line
    #[must_use]
    pub fn new(program: &str, args: Vec<String>, env: HashMap<String, String>) -> Arc<Self> {
        Arc::new(Self {
            child: Mutex::new(None),
            pid: AtomicU64::new(0),
            pending: dashmap::DashMap::new(),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            program: program.to_string(),
            args,
            env,
            writer: Mutex::new(None),
        })
    }

    /// Spawn the subprocess and complete the protocol handshake
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Inherited environment with the configured overlay on top
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        // The child leads its own process group so close() can signal
        // children and grandchildren in one sweep.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transport(format!("Failed to spawn '{}': {e}", self.program)))?;

        if let Some(pid) = child.id() {
            self.pid.store(u64::from(pid), Ordering::Relaxed);
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stdout".to_string()))?;

        *self.writer.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        // Reader task: route response lines to their pending waiters
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if let Err(e) = transport.handle_response(&line) {
                            error!(error = %e, "Failed to handle provider response line");
                        }
                    }
                    Ok(None) => {
                        debug!("Provider stdout EOF");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Error reading provider stdout");
                        break;
                    }
                }
            }
            transport.connected.store(false, Ordering::Relaxed);
        });

        self.initialize().await
    }

    /// Complete the MCP initialize handshake
    async fn initialize(&self) -> Result<()> {
        let response = self
            .request(
                "initialize",
                Some(serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "mcp-airlock",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                })),
            )
            .await?;

        if let Some(err) = response.error {
            return Err(Error::Transport(format!("Initialize failed: {}", err.message)));
        }

        tokio::task::yield_now().await;
        self.notify("notifications/initialized", None).await?;
        tokio::task::yield_now().await;

        self.connected.store(true, Ordering::Relaxed);
        debug!(program = %self.program, "Stdio transport initialized");
        Ok(())
    }

    /// Route a response line to its pending waiter
    fn handle_response(&self, line: &str) -> Result<()> {
        let response: JsonRpcResponse = serde_json::from_str(line)?;
        if let Some(ref id) = response.id {
            if let Some((_, sender)) = self.pending.remove(&id.to_string()) {
                let _ = sender.send(response);
            }
        }
        Ok(())
    }

    /// Write one framed message to stdin
    async fn write_message(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(ref mut stdin) = *writer else {
            return Err(Error::Transport("Not connected".to_string()));
        };
        stdin
            .write_all(message.as_bytes())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        drop(writer);
        tokio::task::yield_now().await;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap)] // request IDs won't exceed i64::MAX
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed) as i64)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id();
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: id.clone(),
            method: method.to_string(),
            params,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.to_string(), tx);

        let message = serde_json::to_string(&request)?;
        self.write_message(&message).await?;

        match tokio::time::timeout(std::time::Duration::from_secs(30), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport("Response channel closed".to_string())),
            Err(_) => {
                self.pending.remove(&id.to_string());
                Err(Error::Transport("Request timed out".to_string()))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        self.write_message(&serde_json::to_string(&notification)?)
            .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn child_pid(&self) -> Option<u32> {
        let pid = self.pid.load(Ordering::Relaxed);
        (pid != 0).then(|| u32::try_from(pid).unwrap_or(0))
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        // Closing stdin lets a cooperative provider exit on its own.
        *self.writer.lock().await = None;

        // Then the two-phase group kill reaches anything that stayed.
        if let Some(pid) = self.child_pid() {
            process::terminate_group(pid).await;
        }
        if let Some(ref mut child) = *self.child.lock().await {
            let _ = child.kill().await;
        }

        Ok(())
    }
}
