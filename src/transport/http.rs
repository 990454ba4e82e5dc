//! Streamable HTTP transport

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, header};
use serde_json::Value;
use tracing::{debug, warn};

use super::Transport;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId};
use crate::{Error, Result};

/// Mask a secret header value for log emission: a short prefix, then an
/// ellipsis. Values shorter than the prefix are fully masked.
#[must_use]
pub fn mask_header_value(value: &str) -> String {
    const PREFIX: usize = 8;
    if value.len() <= PREFIX {
        "***".to_string()
    } else {
        format!("{}…", &value[..PREFIX])
    }
}

/// HTTP transport for streamable-HTTP providers
pub struct HttpTransport {
    /// HTTP client
    client: Client,
    /// Endpoint URL
    url: String,
    /// Custom headers from the provider config
    headers: HashMap<String, String>,
    /// Session ID assigned by the server
    session_id: RwLock<Option<String>>,
    /// Request ID counter
    request_id: AtomicU64,
    /// Connected flag
    connected: AtomicBool,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(
        url: &str,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        for (key, value) in &headers {
            if key.eq_ignore_ascii_case("authorization") {
                debug!(header = %key, value = %mask_header_value(value), "Provider auth header configured");
            }
        }

        let client = Client::builder()
            .timeout(timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(Arc::new(Self {
            client,
            url: url.to_string(),
            headers,
            session_id: RwLock::new(None),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }))
    }

    /// Complete the protocol handshake
    pub async fn initialize(&self) -> Result<()> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: RequestId::Number(0),
            method: "initialize".to_string(),
            params: Some(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "mcp-airlock",
                    "version": env!("CARGO_PKG_VERSION")
                }
            })),
        };

        let response = self.send_request(&request).await?;
        if let Some(err) = response.error {
            return Err(Error::Transport(format!("Initialize failed: {}", err.message)));
        }

        self.notify("notifications/initialized", None).await?;
        self.connected.store(true, Ordering::Relaxed);
        debug!(url = %self.url, "HTTP transport initialized");
        Ok(())
    }

    fn request_headers(&self) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json, text/event-stream"),
        );
        if let Ok(version) = PROTOCOL_VERSION.parse() {
            headers.insert("MCP-Protocol-Version", version);
        }
        if let Some(ref session_id) = *self.session_id.read() {
            if let Ok(id) = session_id.parse() {
                headers.insert("MCP-Session-Id", id);
            }
        }
        for (key, value) in &self.headers {
            if let (Ok(k), Ok(v)) = (
                key.parse::<header::HeaderName>(),
                value.parse::<header::HeaderValue>(),
            ) {
                headers.insert(k, v);
            }
        }
        headers
    }

    /// Send a raw request, tolerating both JSON and SSE-framed responses
    async fn send_request(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.request_headers())
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if let Some(session_id) = response.headers().get("mcp-session-id") {
            if let Ok(id) = session_id.to_str() {
                *self.session_id.write() = Some(id.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("HTTP error: {status}")));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            Self::parse_sse_response(response).await
        } else {
            response.json().await.map_err(|e| Error::Transport(e.to_string()))
        }
    }

    /// Extract the JSON-RPC response from an SSE body
    async fn parse_sse_response(response: reqwest::Response) -> Result<JsonRpcResponse> {
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                return serde_json::from_str(data).map_err(|e| Error::Transport(e.to_string()));
            }
        }
        Err(Error::Transport("No data in SSE response".to_string()))
    }

    #[allow(clippy::cast_possible_wrap)] // request IDs won't exceed i64::MAX
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed) as i64)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id(),
            method: method.to_string(),
            params,
        };
        self.send_request(&request).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.url)
            .headers(self.request_headers())
            .json(&notification)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Notification failed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        // Terminate the server-side session when one was assigned
        let session_id = self.session_id.read().clone();
        if let Some(ref id) = session_id {
            let _ = self
                .client
                .delete(&self.url)
                .header("MCP-Session-Id", id)
                .send()
                .await;
        }
        Ok(())
    }
}
