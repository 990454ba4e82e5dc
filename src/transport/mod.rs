//! Transport implementations for provider sessions

mod http;
mod stdio;

pub use self::http::HttpTransport;
pub use self::stdio::StdioTransport;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Result, protocol::JsonRpcResponse};

/// Transport trait for JSON-RPC communication with a provider
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Check if the transport is connected
    fn is_connected(&self) -> bool;

    /// PID of the owned child process, if the transport spawned one
    fn child_pid(&self) -> Option<u32> {
        None
    }

    /// Close the transport, terminating any owned child process group
    async fn close(&self) -> Result<()>;
}
