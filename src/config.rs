//! Configuration management
//!
//! Two distinct documents live here: the gateway's own configuration
//! (figment: YAML file + `AIRLOCK_` env overrides, the usual layering) and
//! provider launch configs imported from an MCP client document
//! (`mcpServers` plus an optional `_disabled` sibling).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Provider launch configuration.
///
/// Either command-based (spawn a child speaking JSON-RPC over stdio) or
/// url-based (streamable HTTP session). Used verbatim to open a session and
/// hashed into the schema cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderConfig {
    /// Spawn a local child process
    Command {
        /// Program to execute
        command: String,
        /// Arguments
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        /// Extra environment (overlaid on the inherited environment)
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Connect to a streamable HTTP endpoint
    Url {
        /// Endpoint URL
        url: String,
        /// Extra request headers
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl ProviderConfig {
    /// True for command-based configs
    #[must_use]
    pub fn is_command(&self) -> bool {
        matches!(self, Self::Command { .. })
    }

    /// Resolve the program and argument list to actually spawn.
    ///
    /// `npx`-style Node wrappers are batch scripts on Windows and must go
    /// through `cmd /c`; elsewhere the command runs directly. A command
    /// containing whitespace is split shell-style.
    #[must_use]
    pub fn resolved_command(&self) -> Option<(String, Vec<String>)> {
        let Self::Command { command, args, .. } = self else {
            return None;
        };

        let mut parts = shlex::split(command).unwrap_or_else(|| vec![command.clone()]);
        if parts.is_empty() {
            parts.push(command.clone());
        }
        let program = parts.remove(0);
        parts.extend(args.iter().cloned());

        if cfg!(windows) && matches!(program.as_str(), "npx" | "npm" | "node" | "yarn" | "pnpm") {
            let mut shell_args = vec!["/c".to_string(), program];
            shell_args.extend(parts);
            return Some(("cmd".to_string(), shell_args));
        }

        Some((program, parts))
    }
}

/// First 16 hex digits of a SHA-256 digest over the canonically serialized
/// `{provider_name, config}` pair.
///
/// `serde_json` object keys sort lexicographically, so equal inputs always
/// produce equal digests regardless of declaration order.
#[must_use]
pub fn config_hash(provider_name: &str, config: &ProviderConfig) -> String {
    let canonical = serde_json::json!({
        "config": config,
        "name": provider_name,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

/// Schema cache key: `"{provider_name}:{16-hex config hash}"`.
#[must_use]
pub fn cache_key(provider_name: &str, config: &ProviderConfig) -> String {
    format!("{provider_name}:{}", config_hash(provider_name, config))
}

/// An imported MCP client launch document.
///
/// The `_disabled` section holds known providers that should be served only
/// through the gateway; their direct launch is suppressed at the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchDocument {
    /// Active provider launch configs
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: HashMap<String, ProviderConfig>,
    /// Providers suppressed at the client and served via the gateway
    #[serde(rename = "_disabled", default, skip_serializing_if = "HashMap::is_empty")]
    pub disabled: HashMap<String, ProviderConfig>,
}

impl LaunchDocument {
    /// Load a launch document from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// All importable provider configs: active entries first, then the
    /// gateway-only `_disabled` entries. Active entries win name clashes.
    #[must_use]
    pub fn importable(&self) -> HashMap<String, ProviderConfig> {
        let mut merged = self.disabled.clone();
        for (name, config) in &self.mcp_servers {
            merged.insert(name.clone(), config.clone());
        }
        merged
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Sandbox host subprocess configuration
    pub sandbox: SandboxHostConfig,
    /// Execution limits applied at the public API surface
    pub limits: ExecutionLimits,
    /// Override for the settings document path (defaults to
    /// `~/.mcp-airlock/settings.json`)
    pub settings_path: Option<String>,
    /// Override for the persistent schema cache path (defaults to
    /// `~/.mcp-airlock/schema-cache.json`)
    pub schema_cache_path: Option<String>,
}

/// Sandbox host subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxHostConfig {
    /// Command that launches the isolate host
    pub command: String,
    /// Arguments
    pub args: Vec<String>,
    /// Port the host listens on
    pub port: u16,
    /// Readiness poll attempts (spaced `ready_poll_interval` apart)
    pub ready_poll_attempts: u32,
    /// Delay between readiness polls
    #[serde(with = "duration_millis")]
    pub ready_poll_interval: Duration,
    /// Upper wall-clock bound on readiness, regardless of attempts
    #[serde(with = "duration_millis")]
    pub ready_deadline: Duration,
}

impl Default for SandboxHostConfig {
    fn default() -> Self {
        Self {
            command: "workerd".to_string(),
            args: Vec::new(),
            port: 8787,
            ready_poll_attempts: 50,
            ready_poll_interval: Duration::from_millis(200),
            ready_deadline: Duration::from_secs(10),
        }
    }
}

/// Execution limits applied before dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Maximum user code length in characters
    pub max_code_len: usize,
    /// Default execution timeout when the caller supplies none
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,
    /// Deadline for opening a provider session
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_code_len: 50_000,
            default_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then an optional YAML file, then
    /// `AIRLOCK_`-prefixed environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("AIRLOCK_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn command_config() -> ProviderConfig {
        ProviderConfig::Command {
            command: "node".to_string(),
            args: vec!["server.js".to_string()],
            env: HashMap::new(),
        }
    }

    // ── config hashing ────────────────────────────────────────────────

    #[test]
    fn equal_inputs_hash_equally() {
        assert_eq!(
            config_hash("github", &command_config()),
            config_hash("github", &command_config())
        );
    }

    #[test]
    fn hash_is_sixteen_hex_digits() {
        let hash = config_hash("github", &command_config());
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn name_contributes_to_hash() {
        assert_ne!(
            config_hash("github", &command_config()),
            config_hash("gitlab", &command_config())
        );
    }

    #[test]
    fn config_contributes_to_hash() {
        let other = ProviderConfig::Url {
            url: "https://mcp.example.com".to_string(),
            headers: HashMap::new(),
        };
        assert_ne!(
            config_hash("github", &command_config()),
            config_hash("github", &other)
        );
    }

    #[test]
    fn cache_key_embeds_name_and_hash() {
        let key = cache_key("github", &command_config());
        let hash = config_hash("github", &command_config());
        assert_eq!(key, format!("github:{hash}"));
    }

    // ── ProviderConfig ────────────────────────────────────────────────

    #[test]
    fn untagged_union_picks_command_variant() {
        let raw = serde_json::json!({"command": "npx", "args": ["-y", "server"]});
        let config: ProviderConfig = serde_json::from_value(raw).unwrap();
        assert!(config.is_command());
    }

    #[test]
    fn untagged_union_picks_url_variant() {
        let raw = serde_json::json!({"url": "https://mcp.example.com/sse"});
        let config: ProviderConfig = serde_json::from_value(raw).unwrap();
        assert!(!config.is_command());
    }

    #[test]
    fn resolved_command_splits_whitespace() {
        let config = ProviderConfig::Command {
            command: "uv run server".to_string(),
            args: vec!["--port".to_string(), "0".to_string()],
            env: HashMap::new(),
        };
        let (program, args) = config.resolved_command().unwrap();
        #[cfg(not(windows))]
        {
            assert_eq!(program, "uv");
            assert_eq!(args, vec!["run", "server", "--port", "0"]);
        }
        #[cfg(windows)]
        {
            assert_eq!(program, "uv");
            let _ = args;
        }
    }

    #[test]
    fn url_config_has_no_command() {
        let config = ProviderConfig::Url {
            url: "https://mcp.example.com".to_string(),
            headers: HashMap::new(),
        };
        assert!(config.resolved_command().is_none());
    }

    // ── LaunchDocument ────────────────────────────────────────────────

    #[test]
    fn launch_document_reads_disabled_section() {
        let raw = serde_json::json!({
            "mcpServers": {
                "github": {"command": "npx", "args": ["-y", "github-mcp"]}
            },
            "_disabled": {
                "filesystem": {"command": "npx", "args": ["-y", "fs-mcp"]}
            }
        });
        let doc: LaunchDocument = serde_json::from_value(raw).unwrap();
        assert_eq!(doc.mcp_servers.len(), 1);
        assert_eq!(doc.disabled.len(), 1);

        let importable = doc.importable();
        assert_eq!(importable.len(), 2);
        assert!(importable.contains_key("filesystem"));
    }

    #[test]
    fn active_entry_wins_name_clash() {
        let active = command_config();
        let shadowed = ProviderConfig::Url {
            url: "https://old.example.com".to_string(),
            headers: HashMap::new(),
        };
        let doc = LaunchDocument {
            mcp_servers: HashMap::from([("github".to_string(), active.clone())]),
            disabled: HashMap::from([("github".to_string(), shadowed)]),
        };
        assert_eq!(doc.importable().get("github"), Some(&active));
    }

    // ── Config defaults ───────────────────────────────────────────────

    #[test]
    fn default_limits_match_documented_caps() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.max_code_len, 50_000);
        assert_eq!(limits.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn default_sandbox_readiness_budget() {
        let sandbox = SandboxHostConfig::default();
        assert_eq!(sandbox.ready_poll_attempts, 50);
        assert_eq!(sandbox.ready_poll_interval, Duration::from_millis(200));
        assert_eq!(sandbox.ready_deadline, Duration::from_secs(10));
    }
}
