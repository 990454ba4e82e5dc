//! Provider sessions
//!
//! A [`ProviderSession`] is the live client bound to one provider, whether
//! over a spawned child process or streamable HTTP. Sessions opened for
//! schema discovery may be closed immediately; sessions bound to a live
//! instance stay open for the instance's lifetime and are reused by the
//! RPC bridge.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::protocol::{Content, PromptDescriptor, PromptsListResult, ToolDescriptor, ToolsCallResult, ToolsListResult};
use crate::transport::{HttpTransport, StdioTransport, Transport};
use crate::{Error, Result};

/// A live client session bound to one provider
pub struct ProviderSession {
    /// Provider name (for diagnostics)
    provider_name: String,
    /// Underlying transport; owns the child process for command configs
    transport: Arc<dyn Transport>,
}

impl ProviderSession {
    /// Open a session for `config`, bounded by `connect_timeout`.
    ///
    /// Failures are reported as connection errors naming the provider.
    pub async fn connect(
        provider_name: &str,
        config: &ProviderConfig,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let connect = Self::connect_inner(provider_name, config);
        match tokio::time::timeout(connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(Error::connection(
                provider_name,
                format!("connect timed out after {connect_timeout:?}"),
            )),
        }
    }

    async fn connect_inner(provider_name: &str, config: &ProviderConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = match config {
            ProviderConfig::Command { env, .. } => {
                let (program, args) = config
                    .resolved_command()
                    .ok_or_else(|| Error::connection(provider_name, "empty command"))?;
                let transport = StdioTransport::new(&program, args, env.clone());
                transport
                    .start()
                    .await
                    .map_err(|e| Error::connection(provider_name, e.to_string()))?;
                transport
            }
            ProviderConfig::Url { url, headers } => {
                let transport =
                    HttpTransport::new(url, headers.clone(), Duration::from_secs(30))
                        .map_err(|e| Error::connection(provider_name, e.to_string()))?;
                transport
                    .initialize()
                    .await
                    .map_err(|e| Error::connection(provider_name, e.to_string()))?;
                transport
            }
        };

        Ok(Self {
            provider_name: provider_name.to_string(),
            transport,
        })
    }

    /// Provider name this session is bound to
    #[must_use]
    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// PID of the owned child process, for command-based sessions
    #[must_use]
    pub fn child_pid(&self) -> Option<u32> {
        self.transport.child_pid()
    }

    /// List the provider's declared tools
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let response = self.transport.request("tools/list", None).await?;
        if let Some(err) = response.error {
            return Err(Error::connection(
                &self.provider_name,
                format!("tools/list failed: {}", err.message),
            ));
        }
        let result: ToolsListResult = serde_json::from_value(response.result.unwrap_or_default())
            .map_err(|e| {
                Error::connection(&self.provider_name, format!("malformed tools/list result: {e}"))
            })?;
        Ok(result.tools)
    }

    /// List the provider's declared prompts.
    ///
    /// Providers without a prompts capability answer with a protocol error;
    /// that is treated as "no prompts", not a failure.
    pub async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>> {
        let response = self.transport.request("prompts/list", None).await?;
        if response.error.is_some() {
            debug!(provider = %self.provider_name, "Provider declares no prompts");
            return Ok(Vec::new());
        }
        let result: PromptsListResult = serde_json::from_value(response.result.unwrap_or_default())
            .map_err(|e| {
                Error::connection(
                    &self.provider_name,
                    format!("malformed prompts/list result: {e}"),
                )
            })?;
        Ok(result.prompts)
    }

    /// Invoke a tool and normalize the result.
    ///
    /// When the provider returns a structured `content` envelope whose first
    /// item is text, the text is JSON-decoded if possible, otherwise returned
    /// raw. Any other shape passes through unchanged. Callers must tolerate
    /// both shapes.
    pub async fn call_tool(&self, name: &str, input: Value) -> Result<Value> {
        let response = self
            .transport
            .request(
                "tools/call",
                Some(serde_json::json!({
                    "name": name,
                    "arguments": input,
                })),
            )
            .await?;

        if let Some(err) = response.error {
            return Err(Error::connection(
                &self.provider_name,
                format!("tool '{name}' failed: {}", err.message),
            ));
        }

        let raw = response.result.unwrap_or(Value::Null);
        normalize_call_result(raw, &self.provider_name, name)
    }

    /// Close the session, terminating any owned child process group
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

/// Normalize a `tools/call` result value.
///
/// Error envelopes surface as provider errors with the first text item as
/// the message; success envelopes have their first text item JSON-decoded
/// when possible.
fn normalize_call_result(raw: Value, provider: &str, tool: &str) -> Result<Value> {
    let Ok(envelope) = serde_json::from_value::<ToolsCallResult>(raw.clone()) else {
        return Ok(raw);
    };

    let first_text = envelope.content.iter().find_map(|item| match item {
        Content::Text { text } => Some(text.clone()),
        _ => None,
    });

    if envelope.is_error {
        let message = first_text.unwrap_or_else(|| "tool reported an error".to_string());
        return Err(Error::connection(
            provider,
            format!("tool '{tool}' failed: {message}"),
        ));
    }

    match first_text {
        Some(text) => Ok(serde_json::from_str(&text).unwrap_or(Value::String(text))),
        None => Ok(raw),
    }
}
