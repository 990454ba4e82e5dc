//! `/tool-rpc` route: tool invocations from sandbox workers

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::BridgeState;

/// Handle one tool invocation.
///
/// 400 for input framing errors (missing fields), 404 for an unknown
/// provider id, 500 with `{success:false, error}` for downstream provider
/// failures. Bodies never include stack traces.
pub async fn handle(State(state): State<Arc<BridgeState>>, Json(body): Json<Value>) -> Response {
    let Some(provider_id) = body.get("providerId").and_then(Value::as_str) else {
        return framing_error("missing field: providerId");
    };
    let Some(tool_name) = body.get("toolName").and_then(Value::as_str) else {
        return framing_error("missing field: toolName");
    };
    let input = body.get("input").cloned().unwrap_or(json!({}));

    let Some(session) = state.sessions.get(provider_id).map(|s| Arc::clone(&s)) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": format!("unknown provider: {provider_id}"),
            })),
        )
            .into_response();
    };

    debug!(provider = provider_id, tool = tool_name, "Bridging tool call");
    match session.call_tool(tool_name, input).await {
        Ok(result) => Json(json!({"success": true, "result": result})).into_response(),
        Err(e) => {
            warn!(provider = provider_id, tool = tool_name, error = %e, "Bridged tool call failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": e.to_string()})),
            )
                .into_response()
        }
    }
}

fn framing_error(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "error": message})),
    )
        .into_response()
}
