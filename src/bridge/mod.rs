//! Loopback RPC bridge
//!
//! One axum server bound to `127.0.0.1` on an OS-assigned port, started
//! once at supervisor construction and reused across all executions. It
//! mounts two routes: `/tool-rpc`, which lets sandbox workers invoke real
//! provider tools, and `/fetch-proxy`, the policy-enforcing outbound
//! channel workers are wired to when their policy grants egress.

mod fetch_proxy;
mod tool_rpc;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{any, post};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::provider::ProviderSession;
use crate::{Error, Result};

/// Shared state behind both routes
pub struct BridgeState {
    /// Live provider sessions, keyed by instance id. Shared with the
    /// supervisor, which owns insertion and removal.
    pub sessions: Arc<DashMap<String, Arc<ProviderSession>>>,
    /// Outbound client for the fetch proxy's forwarding leg
    pub client: reqwest::Client,
}

/// Handle to the running bridge server
pub struct RpcBridge {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RpcBridge {
    /// Bind the bridge on a loopback OS-assigned port and start serving
    pub async fn start(sessions: Arc<DashMap<String, Arc<ProviderSession>>>) -> Result<Self> {
        let state = Arc::new(BridgeState {
            sessions,
            client: reqwest::Client::builder()
                .build()
                .map_err(|e| Error::worker(format!("fetch proxy client: {e}")))?,
        });

        let app = Router::new()
            .route("/tool-rpc", post(tool_rpc::handle))
            .route("/fetch-proxy", any(fetch_proxy::handle))
            .route("/fetch-proxy/{*path}", any(fetch_proxy::handle))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::worker(format!("bridge bind failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::worker(format!("bridge local_addr: {e}")))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        info!(addr = %addr, "RPC bridge listening");
        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Bound address
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL workers use for tool invocations
    #[must_use]
    pub fn tool_rpc_url(&self) -> String {
        format!("http://{}/tool-rpc", self.addr)
    }

    /// URL bound as the worker's global outbound when egress is enabled
    #[must_use]
    pub fn fetch_proxy_url(&self) -> String {
        format!("http://{}/fetch-proxy", self.addr)
    }

    /// Close the listener and wait for in-flight requests to drain
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
