//! MCP Airlock - zero-trust gateway for sandboxed tool execution

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mcp_airlock::config::{Config, LaunchDocument};
use mcp_airlock::{Supervisor, cli::Cli, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        sandbox = %config.sandbox.command,
        "Starting MCP Airlock"
    );

    let supervisor = match Supervisor::new(config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create supervisor: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Import providers from a launch document when one is supplied.
    if let Some(ref path) = cli.import {
        match LaunchDocument::load(path) {
            Ok(doc) => {
                for (name, provider_config) in doc.importable() {
                    match supervisor.load_provider(&name, provider_config).await {
                        Ok(instance) => info!(
                            provider = %name,
                            id = %instance.id,
                            tools = instance.tools.len(),
                            "Provider loaded"
                        ),
                        Err(e) => error!(
                            provider = %name,
                            "{}",
                            mcp_airlock::diagnostics::render_failure(&e, None, false)
                        ),
                    }
                }
            }
            Err(e) => {
                error!("Failed to read launch document: {e}");
                supervisor.shutdown().await;
                return ExitCode::FAILURE;
            }
        }
    }

    // Run until interrupted, then shut down within the bounded deadline.
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt received"),
        Err(e) => error!("Signal handler error: {e}"),
    }

    supervisor.shutdown().await;
    info!("Shutdown complete");
    ExitCode::SUCCESS
}
