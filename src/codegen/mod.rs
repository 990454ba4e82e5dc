//! Worker program generation
//!
//! Assembles, per execution, a self-contained JavaScript worker: a typed
//! proxy over the provider's tools, a log capture, an optional
//! network-egress shim keyed to the provider's policy, and the user snippet
//! embedded as executable statements. The sandbox host runs the program in
//! an isolate with no ambient filesystem or network; every capability the
//! program touches is bound explicitly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::policy::Policy;
use crate::protocol::ToolDescriptor;
use crate::schema::sanitize_identifier;

/// Name of the single module in every generated program
const MAIN_MODULE: &str = "worker.js";

/// A generated worker program, in the sandbox host's wire shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProgram {
    /// Entry module name
    pub main_module: String,
    /// Module name to source text
    pub modules: HashMap<String, String>,
    /// Environment descriptor bound into the worker
    pub env: HashMap<String, String>,
    /// Outbound channel for the worker; `None` denies egress at the runtime
    /// level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_outbound: Option<String>,
}

/// The worker's structured response, returned verbatim by the host
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerResponse {
    /// Whether the snippet ran to completion
    pub success: bool,
    /// Captured log text
    #[serde(default)]
    pub output: String,
    /// Value returned by the snippet
    #[serde(default)]
    pub result: Value,
    /// Error text on failure
    #[serde(default)]
    pub error: Option<String>,
    /// Stack excerpt on failure
    #[serde(default)]
    pub stack: Option<String>,
    /// Counters maintained by the tool proxy
    #[serde(default)]
    pub metrics: WorkerMetrics,
}

/// Tool-call counters reported by the worker
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerMetrics {
    /// Number of tool invocations
    #[serde(default)]
    pub tool_calls_made: u32,
    /// Names of tools invoked, in first-use order
    #[serde(default)]
    pub tools_called: Vec<String>,
}

/// Stable worker id: first 16 hex digits of a SHA-256 over the provider id
/// and the snippet. Identical code against the same provider reuses the
/// same isolate key.
#[must_use]
pub fn worker_id(provider_id: &str, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider_id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Escape a string for inclusion inside a double-quoted JS literal.
///
/// No backslash, quote, newline, carriage return, tab, or Unicode line
/// separator can terminate the synthesized literal.
#[must_use]
pub fn escape_js_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '`' => out.push_str("\\`"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            other => out.push(other),
        }
    }
    out
}

/// Assemble the worker program for one execution.
///
/// `rpc_url` is the bridge's `/tool-rpc` endpoint; `fetch_proxy_url` is the
/// policy-enforcing outbound channel, bound as the worker's global outbound
/// only when the policy enables any egress.
#[must_use]
pub fn generate_worker_program(
    provider_id: &str,
    tools: &[ToolDescriptor],
    api_text: &str,
    user_code: &str,
    policy: &Policy,
    rpc_url: &str,
    fetch_proxy_url: &str,
) -> WorkerProgram {
    let egress = policy.egress_enabled();

    let mut env = HashMap::new();
    env.insert("PROVIDER_ID".to_string(), provider_id.to_string());
    env.insert("RPC_URL".to_string(), rpc_url.to_string());
    env.insert("NETWORK_ENABLED".to_string(), egress.to_string());
    // Declarative resource caps; the host runtime applies what it honors.
    env.insert("LIMIT_CPU_MS".to_string(), policy.limits.cpu_ms.to_string());
    env.insert(
        "LIMIT_MEMORY_MB".to_string(),
        policy.limits.memory_mb.to_string(),
    );
    env.insert(
        "LIMIT_MAX_SUBREQUESTS".to_string(),
        policy.limits.max_subrequests.to_string(),
    );
    // Filesystem permissions, for hosts that can mount scoped directories.
    env.insert(
        "FS_ENABLED".to_string(),
        policy.filesystem.enabled.to_string(),
    );
    if policy.filesystem.enabled {
        env.insert(
            "FS_READ_PATHS".to_string(),
            policy.filesystem.read_paths.join(","),
        );
        env.insert(
            "FS_WRITE_PATHS".to_string(),
            policy.filesystem.write_paths.join(","),
        );
    }

    let mut modules = HashMap::new();
    modules.insert(
        MAIN_MODULE.to_string(),
        render_worker_source(tools, api_text, user_code, policy),
    );

    WorkerProgram {
        main_module: MAIN_MODULE.to_string(),
        modules,
        env,
        global_outbound: egress.then(|| fetch_proxy_url.to_string()),
    }
}

/// Render the worker module source
fn render_worker_source(
    tools: &[ToolDescriptor],
    api_text: &str,
    user_code: &str,
    policy: &Policy,
) -> String {
    let mut source = String::with_capacity(4096 + user_code.len());

    source.push_str("// Generated worker: tool proxy, log capture, policy shim, user snippet.\n");
    for line in api_text.lines() {
        if line.starts_with("//") {
            source.push_str(line);
        } else {
            source.push_str("// ");
            source.push_str(line);
        }
        source.push('\n');
    }
    source.push('\n');

    source.push_str(&render_log_capture());
    source.push_str(&render_stubs(tools));
    source.push_str(&render_proxy());
    if policy.egress_enabled() {
        source.push_str(&render_fetch_guard(policy));
    }
    source.push_str(&render_entry(policy.egress_enabled()));
    source.push_str(&render_user_code(user_code));
    source
}

fn render_log_capture() -> String {
    r#"const __logs = [];
function __fmt(value) {
  if (typeof value === "string") return value;
  try { return JSON.stringify(value); } catch { return String(value); }
}
function __installLogCapture() {
  __logs.length = 0;
  const write = (...args) => { __logs.push(args.map(__fmt).join(" ")); };
  console.log = write;
  console.info = write;
  console.warn = write;
  console.error = write;
}

"#
    .to_string()
}

/// One stub per tool. Stubs are registered under both the raw tool name and
/// its sanitized identifier so `tools.search_items` and
/// `tools["repo/list"]` both resolve.
fn render_stubs(tools: &[ToolDescriptor]) -> String {
    let mut out = String::from(
        "function __stubs(env) {\n  const byName = Object.create(null);\n  const register = (raw, alias, fn) => {\n    byName[raw] = { raw, fn };\n    if (!(alias in byName)) byName[alias] = { raw, fn };\n  };\n",
    );
    for tool in tools {
        let raw = escape_js_string(&tool.name);
        let alias = escape_js_string(&sanitize_identifier(&tool.name));
        out.push_str(&format!(
            "  register(\"{raw}\", \"{alias}\", async (input) => env.TOOL_BRIDGE.call_tool(\"{raw}\", input ?? {{}}));\n"
        ));
    }
    out.push_str("  return byName;\n}\n\n");
    out
}

/// The proxy counts invocations, records raw tool names, and produces the
/// unknown-tool diagnostic. Awaitable/iterator probes (`then`, symbols)
/// return undefined instead of raising so promise-resolution and spread
/// protocols keep working.
fn render_proxy() -> String {
    r#"const __metrics = { toolCallsMade: 0, toolsCalled: new Set() };
function __toolProxy(env) {
  const stubs = __stubs(env);
  const available = Object.values(stubs).map((entry) => entry.raw);
  const names = [...new Set(available)].join(", ");
  return new Proxy(Object.create(null), {
    get(_target, prop) {
      if (typeof prop === "symbol" || prop === "then" || prop === "toJSON") {
        return undefined;
      }
      const entry = stubs[prop];
      if (!entry) {
        throw new Error(`tool ${String(prop)} not found; available: ${names}`);
      }
      return async (input) => {
        __metrics.toolCallsMade += 1;
        __metrics.toolsCalled.add(entry.raw);
        return entry.fn(input);
      };
    },
  });
}

"#
    .to_string()
}

/// The egress shim wraps the native fetch, attaches the policy headers, and
/// rethrows policy 403s as errors instead of handing the response to user
/// code.
fn render_fetch_guard(policy: &Policy) -> String {
    let hosts = policy
        .outbound
        .allowed_hosts
        .as_ref()
        .map(|hosts| hosts.join(","))
        .unwrap_or_default();
    let allow_localhost = policy.outbound.allow_localhost;
    format!(
        r#"function __installFetchGuard() {{
  if (typeof globalThis.fetch !== "function") return;
  const native = globalThis.fetch.bind(globalThis);
  const guarded = async (resource, init) => {{
    const request = new Request(resource, init);
    const headers = new Headers(request.headers);
    headers.set("X-Allowed-Hosts", "{hosts}");
    headers.set("X-Allow-Localhost", "{allow_localhost}");
    const response = await native(new Request(request, {{ headers }}));
    if (response.status === 403) {{
      let body = null;
      try {{ body = await response.clone().json(); }} catch {{}}
      if (body && typeof body.error === "string" && body.error.startsWith("network policy")) {{
        throw new Error(body.error);
      }}
    }}
    return response;
  }};
  globalThis.fetch = guarded;
}}

"#,
        hosts = escape_js_string(&hosts),
    )
}

/// Entry point: deserialize `{code, timeout}`, install the log capture,
/// race the snippet against the timeout, report the structured result.
fn render_entry(egress: bool) -> String {
    let install_guard = if egress {
        "    __installFetchGuard();\n"
    } else {
        ""
    };
    format!(
        r#"export default {{
  async fetch(request, env) {{
    let payload = {{}};
    try {{ payload = await request.json(); }} catch {{}}
    const timeout = Number(payload && payload.timeout) || 30000;
    __installLogCapture();
    __metrics.toolCallsMade = 0;
    __metrics.toolsCalled.clear();
{install_guard}    const tools = __toolProxy(env);
    const expired = new Promise((_resolve, reject) => {{
      setTimeout(() => reject(new Error(`execution timed out after ${{timeout}}ms`)), timeout);
    }});
    const snapshot = () => ({{
      tool_calls_made: __metrics.toolCallsMade,
      tools_called: [...__metrics.toolsCalled],
    }});
    try {{
      const result = await Promise.race([__userCode(tools), expired]);
      return Response.json({{
        success: true,
        output: __logs.join("\n"),
        result: result === undefined ? null : result,
        metrics: snapshot(),
      }});
    }} catch (err) {{
      return Response.json({{
        success: false,
        error: err && err.message ? err.message : String(err),
        stack: err && err.stack ? String(err.stack) : undefined,
        output: __logs.join("\n"),
        metrics: snapshot(),
      }});
    }}
  }},
}};

"#
    )
}

/// The user snippet, embedded as the body of an async function so `await`
/// and `return` work as statements.
fn render_user_code(user_code: &str) -> String {
    format!("async function __userCode(tools) {{\n{user_code}\n}}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: None,
            input_schema: json!({"properties": {}}),
        }
    }

    fn open_policy() -> Policy {
        let mut policy = Policy::unguarded();
        policy.guarded = true;
        policy.outbound.allowed_hosts = Some(vec!["api.example.com".to_string()]);
        policy
    }

    fn generate(tools: &[ToolDescriptor], policy: &Policy) -> WorkerProgram {
        generate_worker_program(
            "prov-1",
            tools,
            "// api",
            "return await tools.search_items({});",
            policy,
            "http://127.0.0.1:4000/tool-rpc",
            "http://127.0.0.1:4000/fetch-proxy",
        )
    }

    // ── escaping ──────────────────────────────────────────────────────

    #[test]
    fn escape_neutralizes_literal_breakers() {
        assert_eq!(escape_js_string(r#"a"b"#), r#"a\"b"#);
        assert_eq!(escape_js_string("a\\b"), "a\\\\b");
        assert_eq!(escape_js_string("a\nb\rc\td"), "a\\nb\\rc\\td");
        assert_eq!(escape_js_string("a'b`c"), "a\\'b\\`c");
        assert_eq!(escape_js_string("a\u{2028}b"), "a\\u2028b");
    }

    #[test]
    fn escape_leaves_ordinary_names_alone() {
        assert_eq!(escape_js_string("search_items"), "search_items");
    }

    // ── worker ids ────────────────────────────────────────────────────

    #[test]
    fn worker_id_is_stable_and_code_sensitive() {
        assert_eq!(worker_id("p", "code"), worker_id("p", "code"));
        assert_ne!(worker_id("p", "code"), worker_id("p", "other"));
        assert_ne!(worker_id("p", "code"), worker_id("q", "code"));
        assert_eq!(worker_id("p", "code").len(), 16);
    }

    // ── program assembly ──────────────────────────────────────────────

    #[test]
    fn program_embeds_user_code_and_stubs() {
        let program = generate(&[tool("search_items")], &Policy::unguarded());
        let source = &program.modules["worker.js"];
        assert!(source.contains("return await tools.search_items({});"));
        assert!(source.contains("register(\"search_items\", \"search_items\""));
        assert!(source.contains("env.TOOL_BRIDGE.call_tool(\"search_items\""));
    }

    #[test]
    fn punctuated_names_are_escaped_and_aliased() {
        let program = generate(&[tool("repo/list\"x")], &Policy::unguarded());
        let source = &program.modules["worker.js"];
        assert!(source.contains(r#"register("repo/list\"x", "repo_list_x""#));
    }

    #[test]
    fn isolated_policy_omits_fetch_guard_and_outbound() {
        let program = generate(&[tool("a")], &Policy::unguarded());
        assert_eq!(program.env["NETWORK_ENABLED"], "false");
        assert!(program.global_outbound.is_none());
        assert!(!program.modules["worker.js"].contains("__installFetchGuard"));
    }

    #[test]
    fn egress_policy_wires_guard_and_outbound() {
        let program = generate(&[tool("a")], &open_policy());
        assert_eq!(program.env["NETWORK_ENABLED"], "true");
        assert_eq!(
            program.global_outbound.as_deref(),
            Some("http://127.0.0.1:4000/fetch-proxy")
        );
        let source = &program.modules["worker.js"];
        assert!(source.contains("__installFetchGuard();"));
        assert!(source.contains("X-Allowed-Hosts"));
        assert!(source.contains("api.example.com"));
    }

    #[test]
    fn env_carries_provider_rpc_and_limits() {
        let program = generate(&[tool("a")], &Policy::unguarded());
        assert_eq!(program.env["PROVIDER_ID"], "prov-1");
        assert_eq!(program.env["RPC_URL"], "http://127.0.0.1:4000/tool-rpc");
        assert!(program.env.contains_key("LIMIT_CPU_MS"));
        assert!(program.env.contains_key("LIMIT_MAX_SUBREQUESTS"));
    }

    #[test]
    fn proxy_special_cases_probe_keys() {
        let program = generate(&[tool("a")], &Policy::unguarded());
        let source = &program.modules["worker.js"];
        assert!(source.contains(r#"prop === "then""#));
        assert!(source.contains(r#"typeof prop === "symbol""#));
        assert!(source.contains("not found; available:"));
    }

    #[test]
    fn wire_shape_uses_camel_case() {
        let program = generate(&[tool("a")], &open_policy());
        let json = serde_json::to_value(&program).unwrap();
        assert!(json.get("mainModule").is_some());
        assert!(json.get("globalOutbound").is_some());
        assert!(json.get("modules").is_some());
    }

    #[test]
    fn worker_response_parses_minimal_failure() {
        let raw = json!({"success": false, "error": "boom"});
        let response: WorkerResponse = serde_json::from_value(raw).unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("boom"));
        assert_eq!(response.metrics.tool_calls_made, 0);
    }
}
