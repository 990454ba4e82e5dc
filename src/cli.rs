//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Zero-trust MCP gateway - sandboxed code execution over provider tools
#[derive(Parser, Debug)]
#[command(name = "mcp-airlock")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AIRLOCK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Provider launch document to import at startup (mcpServers JSON)
    #[arg(long, env = "AIRLOCK_IMPORT")]
    pub import: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "AIRLOCK_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AIRLOCK_LOG_FORMAT")]
    pub log_format: Option<String>,
}
