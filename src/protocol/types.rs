//! Provider-facing MCP type definitions

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool descriptor as declared by a provider.
///
/// Names may contain punctuation; they are treated as opaque strings at this
/// layer and only sanitized when synthesized into a worker program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name
    pub name: String,
    /// Tool description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input JSON Schema (object with `properties` and `required`)
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Prompt descriptor, stored alongside tools for pass-through discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    /// Prompt name
    pub name: String,
    /// Prompt description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Prompt arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

/// Prompt argument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name
    pub name: String,
    /// Argument description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument is required
    #[serde(default)]
    pub required: bool,
}

/// Content item in a tool call response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Content {
    /// Text content
    #[serde(rename = "text")]
    Text {
        /// Text value
        text: String,
    },
    /// Image content
    #[serde(rename = "image")]
    Image {
        /// Base64-encoded data
        data: String,
        /// MIME type
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Embedded resource (passed through opaquely)
    #[serde(rename = "resource")]
    Resource {
        /// Resource contents
        resource: Value,
    },
}

/// `tools/list` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    /// Declared tools
    pub tools: Vec<ToolDescriptor>,
    /// Next cursor for pagination
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `prompts/list` result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsListResult {
    /// Declared prompts
    pub prompts: Vec<PromptDescriptor>,
    /// Next cursor for pagination
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `tools/call` result envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsCallResult {
    /// Content items
    #[serde(default)]
    pub content: Vec<Content>,
    /// Whether the result is an error
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}
