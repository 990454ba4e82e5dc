//! `/fetch-proxy` route: policy-enforcing outbound channel for workers
//!
//! The worker's egress shim attaches two policy headers to every request;
//! this proxy reads them, enforces loopback and allowlist rules, strips the
//! headers, and forwards allowed requests upstream. Requests must arrive in
//! absolute form so the original target survives the hop.

use std::net::IpAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{debug, warn};

use super::BridgeState;
use crate::policy::is_host_allowed;

/// Header carrying the comma-separated allowlist
const ALLOWED_HOSTS_HEADER: &str = "x-allowed-hosts";
/// Header carrying the localhost grant
const ALLOW_LOCALHOST_HEADER: &str = "x-allow-localhost";
/// Cap on proxied request bodies
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Proxy one outbound request from a worker
pub async fn handle(State(state): State<Arc<BridgeState>>, request: Request) -> Response {
    let uri = request.uri().clone();
    let (Some(scheme), Some(authority)) = (uri.scheme_str(), uri.authority()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "fetch proxy requires an absolute request URL"})),
        )
            .into_response();
    };
    let host = authority.host().to_string();

    let allowlist = parse_allowlist(
        request
            .headers()
            .get(ALLOWED_HOSTS_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(""),
    );
    let allow_localhost = request
        .headers()
        .get(ALLOW_LOCALHOST_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    if let Err(message) = enforce(&host, &allowlist, allow_localhost) {
        debug!(host = %host, "Fetch proxy blocked outbound request");
        return (StatusCode::FORBIDDEN, Json(json!({"error": message}))).into_response();
    }

    let method = request.method().clone();
    let mut headers = request.headers().clone();
    headers.remove(ALLOWED_HOSTS_HEADER);
    headers.remove(ALLOW_LOCALHOST_HEADER);
    headers.remove(axum::http::header::HOST);

    let target = format!("{scheme}://{authority}{}", uri.path_and_query().map_or("/", |pq| pq.as_str()));
    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("unreadable request body: {e}")})),
            )
                .into_response();
        }
    };

    let Ok(method) = reqwest::Method::from_bytes(method.as_str().as_bytes()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "unsupported method"})),
        )
            .into_response();
    };

    let mut outbound = state.client.request(method, &target);
    for (name, value) in &headers {
        if let Ok(v) = value.to_str() {
            outbound = outbound.header(name.as_str(), v);
        }
    }
    if !body.is_empty() {
        outbound = outbound.body(body);
    }

    match outbound.send().await {
        Ok(upstream) => relay(upstream).await,
        Err(e) => {
            warn!(target = %target, error = %e, "Fetch proxy upstream request failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": format!("upstream request failed: {e}")})),
            )
                .into_response()
        }
    }
}

/// Relay an upstream response back to the worker
async fn relay(upstream: reqwest::Response) -> Response {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        let lowered = name.as_str().to_ascii_lowercase();
        if matches!(
            lowered.as_str(),
            "transfer-encoding" | "connection" | "content-length"
        ) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    match upstream.bytes().await {
        Ok(bytes) => builder
            .body(axum::body::Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": format!("upstream body failed: {e}")})),
        )
            .into_response(),
    }
}

/// Parse the comma-separated allowlist header
fn parse_allowlist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Apply the network policy to one target host.
///
/// Loopback hosts are blocked unless the localhost grant is set. For other
/// hosts, a present allowlist must match under the wildcard rule; with no
/// allowlist the request passes.
fn enforce(host: &str, allowlist: &[String], allow_localhost: bool) -> Result<(), String> {
    if is_loopback_host(host) {
        if allow_localhost {
            return Ok(());
        }
        return Err(format!("network policy: loopback host {host} is blocked"));
    }
    if !allowlist.is_empty() && !is_host_allowed(host, allowlist) {
        return Err(format!(
            "network policy: {host} is not in the allowed hosts list"
        ));
    }
    Ok(())
}

/// Whether a hostname targets the loopback interface
fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
