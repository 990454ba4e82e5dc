//! Execution results and efficiency/security metrics

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::Policy;
use crate::protocol::ToolDescriptor;
use crate::schema::{tool_schema_chars, total_schema_chars};

/// Rough characters-per-token divisor for the estimated token fields
const CHARS_PER_TOKEN: f64 = 3.5;

/// Unified result of one sandboxed execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the user code ran to completion
    pub success: bool,
    /// Captured log text, in emission order
    pub output: String,
    /// Opaque result value returned by the user code
    pub result: Value,
    /// Error text when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock execution time
    pub execution_time_ms: u64,
    /// Execution metrics
    pub metrics: ExecutionMetrics,
    /// Additional diagnostics for failures (stack excerpts, host status)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<HashMap<String, String>>,
}

/// Per-execution metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Number of tool invocations made by the worker
    pub tool_calls_made: u32,
    /// Names of the tools actually invoked
    pub tools_called: Vec<String>,
    /// Schema context savings
    pub schema_efficiency: SchemaEfficiency,
    /// Security posture the execution ran under
    pub security: SecurityMetrics,
}

/// How much schema context the sandbox approach saved.
///
/// The AI client never sees the full tool schemas; only the tools the
/// snippet actually invoked count as "used".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaEfficiency {
    /// Total tools the provider declares
    pub total_tools: usize,
    /// Tools actually invoked in this execution
    pub tools_used: usize,
    /// Character count of all declared tool schemas
    pub schema_size_total_chars: usize,
    /// Character count of the schemas of invoked tools
    pub schema_size_used_chars: usize,
    /// Percentage of schema context avoided
    pub schema_size_reduction_percent: f64,
    /// Percentage of schema context actually exercised
    pub schema_utilization_percent: f64,
    /// Estimated tokens for the full schema set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_tokens_total: Option<u64>,
    /// Estimated tokens for the used subset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_tokens_used: Option<u64>,
    /// Estimated tokens saved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_tokens_saved: Option<u64>,
}

impl SchemaEfficiency {
    /// Compute efficiency figures for one execution.
    ///
    /// `schema_size_used_chars <= schema_size_total_chars` always holds, and
    /// utilization plus reduction sum to 100 within rounding.
    #[must_use]
    pub fn compute(tools: &[ToolDescriptor], tools_called: &[String]) -> Self {
        let total_chars = total_schema_chars(tools);
        let used_chars: usize = tools
            .iter()
            .filter(|tool| tools_called.iter().any(|name| *name == tool.name))
            .map(tool_schema_chars)
            .sum();

        #[allow(clippy::cast_precision_loss)]
        let utilization = if total_chars == 0 {
            0.0
        } else {
            (used_chars as f64 / total_chars as f64) * 100.0
        };
        let reduction = 100.0 - utilization;

        Self {
            total_tools: tools.len(),
            tools_used: tools
                .iter()
                .filter(|tool| tools_called.iter().any(|name| *name == tool.name))
                .count(),
            schema_size_total_chars: total_chars,
            schema_size_used_chars: used_chars,
            schema_size_reduction_percent: round2(reduction),
            schema_utilization_percent: round2(utilization),
            estimated_tokens_total: Some(estimate_tokens(total_chars)),
            estimated_tokens_used: Some(estimate_tokens(used_chars)),
            estimated_tokens_saved: Some(
                estimate_tokens(total_chars).saturating_sub(estimate_tokens(used_chars)),
            ),
        }
    }
}

/// Security posture of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityMetrics {
    /// Always true: user code never runs in the supervisor's process
    pub sandboxed: bool,
    /// True when the worker had no egress path at all
    pub network_isolation_enabled: bool,
    /// Whether the provider was guarded by policy
    pub policy_guarded: bool,
    /// Number of allowlisted hosts (0 when no allowlist)
    pub allowed_hosts_count: usize,
    /// True when the policy grants no filesystem access
    pub filesystem_isolation_enabled: bool,
}

impl SecurityMetrics {
    /// Derive the security posture from the effective policy
    #[must_use]
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            sandboxed: true,
            network_isolation_enabled: !policy.egress_enabled(),
            policy_guarded: policy.guarded,
            allowed_hosts_count: policy
                .outbound
                .allowed_hosts
                .as_ref()
                .map_or(0, Vec::len),
            filesystem_isolation_enabled: !policy.filesystem.enabled,
        }
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn estimate_tokens(chars: usize) -> u64 {
    (chars as f64 / CHARS_PER_TOKEN).round() as u64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl ExecutionResult {
    /// A failure result that still carries metrics and captured output
    #[must_use]
    pub fn failure(
        error: String,
        output: String,
        execution_time_ms: u64,
        metrics: ExecutionMetrics,
        error_details: Option<HashMap<String, String>>,
    ) -> Self {
        Self {
            success: false,
            output,
            result: Value::Null,
            error: Some(error),
            execution_time_ms,
            metrics,
            error_details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: Some("A tool with a reasonably long description".to_string()),
            input_schema: json!({"properties": {"q": {"type": "string"}}}),
        }
    }

    #[test]
    fn used_never_exceeds_total() {
        let tools = vec![tool("a"), tool("b"), tool("c")];
        let eff = SchemaEfficiency::compute(&tools, &["a".to_string()]);
        assert!(eff.schema_size_used_chars <= eff.schema_size_total_chars);
        assert_eq!(eff.total_tools, 3);
        assert_eq!(eff.tools_used, 1);
    }

    #[test]
    fn utilization_and_reduction_sum_to_hundred() {
        let tools = vec![tool("a"), tool("b"), tool("c")];
        let eff = SchemaEfficiency::compute(&tools, &["b".to_string(), "c".to_string()]);
        let sum = eff.schema_utilization_percent + eff.schema_size_reduction_percent;
        assert!((sum - 100.0).abs() < 0.02, "sum was {sum}");
    }

    #[test]
    fn no_calls_means_full_reduction() {
        let tools = vec![tool("a")];
        let eff = SchemaEfficiency::compute(&tools, &[]);
        assert_eq!(eff.schema_size_used_chars, 0);
        assert!((eff.schema_size_reduction_percent - 100.0).abs() < f64::EPSILON);
        assert_eq!(eff.estimated_tokens_used, Some(0));
    }

    #[test]
    fn empty_tool_set_does_not_divide_by_zero() {
        let eff = SchemaEfficiency::compute(&[], &[]);
        assert_eq!(eff.schema_size_total_chars, 0);
        assert!((eff.schema_utilization_percent).abs() < f64::EPSILON);
    }

    #[test]
    fn token_estimates_divide_by_constant() {
        let tools = vec![tool("a")];
        let eff = SchemaEfficiency::compute(&tools, &[]);
        let expected = ((eff.schema_size_total_chars as f64) / 3.5).round() as u64;
        assert_eq!(eff.estimated_tokens_total, Some(expected));
    }

    #[test]
    fn unknown_called_names_do_not_count() {
        let tools = vec![tool("a")];
        let eff = SchemaEfficiency::compute(&tools, &["ghost".to_string()]);
        assert_eq!(eff.tools_used, 0);
        assert_eq!(eff.schema_size_used_chars, 0);
    }

    #[test]
    fn security_metrics_reflect_default_isolation() {
        let metrics = SecurityMetrics::from_policy(&Policy::unguarded());
        assert!(metrics.sandboxed);
        assert!(metrics.network_isolation_enabled);
        assert!(!metrics.policy_guarded);
        assert_eq!(metrics.allowed_hosts_count, 0);
        assert!(metrics.filesystem_isolation_enabled);
    }

    #[test]
    fn security_metrics_reflect_allowlist() {
        let mut policy = Policy::unguarded();
        policy.guarded = true;
        policy.outbound.allowed_hosts = Some(vec!["api.example.com".to_string()]);
        let metrics = SecurityMetrics::from_policy(&policy);
        assert!(!metrics.network_isolation_enabled);
        assert_eq!(metrics.allowed_hosts_count, 1);
        assert!(metrics.policy_guarded);
    }
}
