//! Integration tests for the loopback RPC bridge
//!
//! These exercise the bridge's wire contract with real sockets: framing
//! errors, unknown providers, and the fetch proxy's absolute-URL
//! requirement. Tool passthrough against a live provider is covered by the
//! supervisor tests.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Value, json};

use mcp_airlock::bridge::RpcBridge;

async fn started_bridge() -> RpcBridge {
    RpcBridge::start(Arc::new(DashMap::new()))
        .await
        .expect("bridge starts on a loopback ephemeral port")
}

#[tokio::test]
async fn tool_rpc_missing_provider_id_is_400() {
    let mut bridge = started_bridge().await;
    let client = reqwest::Client::new();

    let response = client
        .post(bridge.tool_rpc_url())
        .json(&json!({"toolName": "search", "input": {}}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("providerId"));

    bridge.shutdown().await;
}

#[tokio::test]
async fn tool_rpc_missing_tool_name_is_400() {
    let mut bridge = started_bridge().await;
    let client = reqwest::Client::new();

    let response = client
        .post(bridge.tool_rpc_url())
        .json(&json!({"providerId": "p-1"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    bridge.shutdown().await;
}

#[tokio::test]
async fn tool_rpc_unknown_provider_is_404() {
    let mut bridge = started_bridge().await;
    let client = reqwest::Client::new();

    let response = client
        .post(bridge.tool_rpc_url())
        .json(&json!({"providerId": "no-such-id", "toolName": "search", "input": {}}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("no-such-id"));

    bridge.shutdown().await;
}

#[tokio::test]
async fn tool_rpc_errors_never_carry_stack_traces() {
    let mut bridge = started_bridge().await;
    let client = reqwest::Client::new();

    let response = client
        .post(bridge.tool_rpc_url())
        .json(&json!({"providerId": "x", "toolName": "y"}))
        .send()
        .await
        .unwrap();

    let body: Value = response.json().await.unwrap();
    assert!(body.get("stack").is_none());
    assert!(body.get("trace").is_none());

    bridge.shutdown().await;
}

#[tokio::test]
async fn fetch_proxy_rejects_relative_requests() {
    let mut bridge = started_bridge().await;
    let client = reqwest::Client::new();

    // A direct request to the route arrives in origin form; the proxy
    // requires the absolute form the sandbox host forwards.
    let response = client
        .get(bridge.fetch_proxy_url())
        .header("X-Allowed-Hosts", "api.example.com")
        .header("X-Allow-Localhost", "false")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("absolute"));

    bridge.shutdown().await;
}

#[tokio::test]
async fn bridge_urls_are_loopback() {
    let mut bridge = started_bridge().await;
    assert!(bridge.tool_rpc_url().starts_with("http://127.0.0.1:"));
    assert!(bridge.fetch_proxy_url().ends_with("/fetch-proxy"));
    bridge.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_the_listener() {
    let mut bridge = started_bridge().await;
    let url = bridge.tool_rpc_url();
    bridge.shutdown().await;

    let result = reqwest::Client::new()
        .post(&url)
        .json(&json!({}))
        .send()
        .await;
    assert!(result.is_err(), "listener should be closed after shutdown");
}
