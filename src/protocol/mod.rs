//! MCP protocol types consumed by provider sessions

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// MCP protocol version spoken to providers
pub const PROTOCOL_VERSION: &str = "2024-11-05";
