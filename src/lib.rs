//! MCP Airlock Library
//!
//! Zero-trust gateway that exposes local tool-provider (MCP) servers to an
//! AI client through a single aggregating server. Instead of loading every
//! provider's tool schema into prompt context, the gateway runs user
//! snippets of sandboxed code that invoke provider tools by name and return
//! only the distilled result — shrinking context and interposing a security
//! boundary between AI-generated code and the host machine.
//!
//! # Architecture
//!
//! - **Supervisor**: provider lifecycle, execution dispatch, shutdown
//! - **Provider sessions**: stdio and streamable-HTTP JSON-RPC clients
//! - **Schema cache**: two-tier (memory + persistent document)
//! - **Policy registry**: per-provider network/filesystem/resource rules
//! - **RPC bridge**: loopback endpoint bridging sandbox tool calls back to
//!   real providers, plus the policy-enforcing fetch proxy
//! - **Worker codegen**: per-execution sandboxed worker programs
//! - **Sandbox host**: supervised isolate-runtime subprocess

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod cache;
pub mod cli;
pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod process;
pub mod protocol;
pub mod provider;
pub mod sandbox;
pub mod schema;
pub mod security;
pub mod settings;
pub mod supervisor;
pub mod transport;

pub use error::{Error, Result};
pub use supervisor::{InstanceStatus, ProviderInstance, Supervisor};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
