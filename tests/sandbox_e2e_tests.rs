//! End-to-end scenarios against a real isolate runtime
//!
//! These tests exercise the full pipeline: supervisor, worker codegen,
//! sandbox host, RPC bridge, and fetch proxy. They require a workerd-style
//! sandbox host already listening on 127.0.0.1:8787 and `npx` on PATH, so
//! they are ignored by default.
//!
//! Run with: `cargo test --test sandbox_e2e_tests -- --ignored`

#![cfg(unix)]

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use mcp_airlock::Supervisor;
use mcp_airlock::config::{Config, ExecutionLimits, ProviderConfig, SandboxHostConfig};

/// Supervisor wired to an externally managed sandbox host on 8787. The
/// spawned "host" command is inert; readiness polling finds the real one.
async fn supervisor_with_external_host(dir: &TempDir, settings: Option<&str>) -> Supervisor {
    let settings_path = dir.path().join("settings.json");
    if let Some(raw) = settings {
        std::fs::write(&settings_path, raw).unwrap();
    }
    let config = Config {
        sandbox: SandboxHostConfig {
            command: "sleep".to_string(),
            args: vec!["3600".to_string()],
            port: 8787,
            ..Default::default()
        },
        limits: ExecutionLimits::default(),
        settings_path: Some(settings_path.to_string_lossy().into_owned()),
        schema_cache_path: Some(
            dir.path()
                .join("schema-cache.json")
                .to_string_lossy()
                .into_owned(),
        ),
    };
    Supervisor::new(config).await.expect("supervisor starts")
}

fn everything_server() -> ProviderConfig {
    ProviderConfig::Command {
        command: "npx".to_string(),
        args: vec![
            "-y".to_string(),
            "@modelcontextprotocol/server-everything".to_string(),
        ],
        env: HashMap::new(),
    }
}

fn guarded_settings(allowlist: &[&str]) -> String {
    json!({
        "enabled": true,
        "mcpConfigs": [{
            "id": "1",
            "mcpName": "everything",
            "isGuarded": true,
            "network": {
                "enabled": true,
                "allowlist": allowlist,
                "allowLocalhost": false
            }
        }]
    })
    .to_string()
}

#[tokio::test]
#[ignore = "requires a sandbox host on 127.0.0.1:8787 and npx"]
async fn default_isolation_blocks_egress() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor_with_external_host(&dir, None).await;
    let instance = supervisor
        .load_provider("everything", everything_server())
        .await
        .unwrap();

    let result = supervisor
        .execute_in_sandbox(
            &instance.id,
            r#"try {
                await fetch("https://example.com/200");
                return "reached";
            } catch (e) {
                console.log("blocked: " + e.message);
                return "done";
            }"#,
            Some(Duration::from_secs(20)),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.output.contains("blocked"));
    assert!(result.metrics.security.network_isolation_enabled);

    supervisor.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a sandbox host on 127.0.0.1:8787 and npx"]
async fn allowlist_admits_one_host_and_blocks_others() {
    let dir = TempDir::new().unwrap();
    let supervisor =
        supervisor_with_external_host(&dir, Some(&guarded_settings(&["httpcats.example"]))).await;
    let instance = supervisor
        .load_provider("everything", everything_server())
        .await
        .unwrap();

    let result = supervisor
        .execute_in_sandbox(
            &instance.id,
            r#"const allowed = await fetch("https://httpcats.example/200");
            let blocked = null;
            try {
                await fetch("https://other.example/");
            } catch (e) {
                blocked = e.message;
            }
            return { allowedStatus: allowed.status, blocked };"#,
            Some(Duration::from_secs(20)),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.result["allowedStatus"], 200);
    assert!(
        result.result["blocked"]
            .as_str()
            .unwrap()
            .contains("network policy")
    );

    supervisor.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a sandbox host on 127.0.0.1:8787 and npx"]
async fn wildcard_subdomain_allowlist() {
    let dir = TempDir::new().unwrap();
    let supervisor =
        supervisor_with_external_host(&dir, Some(&guarded_settings(&["*.org.example"]))).await;
    let instance = supervisor
        .load_provider("everything", everything_server())
        .await
        .unwrap();

    let result = supervisor
        .execute_in_sandbox(
            &instance.id,
            r#"const ok = await fetch("https://api.org.example/");
            let blocked = null;
            try {
                await fetch("https://raw-api.different.example/");
            } catch (e) {
                blocked = e.message;
            }
            return { okStatus: ok.status, blocked };"#,
            Some(Duration::from_secs(20)),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert!(
        result.result["blocked"]
            .as_str()
            .unwrap()
            .contains("network policy")
    );

    supervisor.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a sandbox host on 127.0.0.1:8787 and npx"]
async fn tool_passthrough_records_metrics() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor_with_external_host(&dir, None).await;
    let instance = supervisor
        .load_provider("everything", everything_server())
        .await
        .unwrap();

    let result = supervisor
        .execute_in_sandbox(
            &instance.id,
            r#"return await tools.echo({message: "hello"});"#,
            Some(Duration::from_secs(20)),
        )
        .await
        .unwrap();

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.metrics.tool_calls_made, 1);
    assert_eq!(result.metrics.tools_called, vec!["echo"]);

    supervisor.shutdown().await;
}

#[tokio::test]
#[ignore = "requires a sandbox host on 127.0.0.1:8787 and npx"]
async fn unknown_tool_diagnostic_lists_available_names() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor_with_external_host(&dir, None).await;
    let instance = supervisor
        .load_provider("everything", everything_server())
        .await
        .unwrap();

    let result = supervisor
        .execute_in_sandbox(
            &instance.id,
            "await tools.no_such_tool({});",
            Some(Duration::from_secs(20)),
        )
        .await
        .unwrap();

    assert!(!result.success);
    let message = result.error.unwrap();
    assert!(message.contains("no_such_tool"));
    assert!(message.contains("echo"), "should list available tools: {message}");

    supervisor.shutdown().await;
}
