//! Guard settings document
//!
//! A user-owned JSON document under `~/.mcp-airlock/settings.json` that the
//! policy registry reads on demand. Unknown fields are ignored; malformed
//! JSON yields the default document rather than an error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

/// Product directory under the user's home
const PRODUCT_DIR: &str = ".mcp-airlock";
/// Settings file name
const SETTINGS_FILE: &str = "settings.json";

/// Top-level guard settings document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Global guard switch; nothing is guarded while this is off
    pub enabled: bool,
    /// Defaults applied where a provider entry leaves a section unset
    pub defaults: GuardDefaults,
    /// Per-provider guard entries
    pub mcp_configs: Vec<ProviderGuardEntry>,
}

/// Default guard sections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuardDefaults {
    /// Network egress defaults
    pub network: NetworkSettings,
    /// Filesystem defaults
    pub file_system: FileSystemSettings,
    /// Resource limit defaults
    pub resource_limits: ResourceLimitSettings,
}

/// Network egress settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkSettings {
    /// Whether the host allowlist applies
    pub enabled: bool,
    /// Allowed hostnames, optionally `*.`-prefixed for subdomain wildcards
    pub allowlist: Vec<String>,
    /// Whether loopback targets are reachable
    pub allow_localhost: bool,
}

/// Filesystem access settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileSystemSettings {
    /// Whether filesystem access is granted at all
    pub enabled: bool,
    /// Readable path prefixes
    pub read_paths: Vec<String>,
    /// Writable path prefixes
    pub write_paths: Vec<String>,
}

/// Resource limit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceLimitSettings {
    /// Wall-clock execution cap in milliseconds
    pub max_execution_time_ms: u64,
    /// Memory cap in megabytes
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: u64,
    /// Cap on tool calls per execution
    #[serde(rename = "maxMCPCalls")]
    pub max_mcp_calls: u32,
}

impl Default for ResourceLimitSettings {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 30_000,
            max_memory_mb: 128,
            max_mcp_calls: 25,
        }
    }
}

/// Per-provider guard entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderGuardEntry {
    /// Entry id
    pub id: String,
    /// Provider name this entry guards
    pub mcp_name: String,
    /// Whether the provider is guarded
    pub is_guarded: bool,
    /// Network overrides (falls back to defaults when absent)
    pub network: Option<NetworkSettings>,
    /// Filesystem overrides
    pub file_system: Option<FileSystemSettings>,
    /// Resource limit overrides
    pub resource_limits: Option<ResourceLimitSettings>,
    /// Last modification timestamp (RFC 3339), informational
    pub last_modified: Option<String>,
}

/// Default on-disk location: `<home>/.mcp-airlock/settings.json`
#[must_use]
pub fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(PRODUCT_DIR)
        .join(SETTINGS_FILE)
}

/// Load settings from `path`.
///
/// A missing file or malformed JSON yields the default document; only the
/// malformed case is logged.
#[must_use]
pub fn load_settings(path: &Path) -> Settings {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Settings::default();
    };
    match serde_json::from_str(&raw) {
        Ok(settings) => settings,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Malformed settings document, using defaults");
            Settings::default()
        }
    }
}

/// Save settings to `path`, creating parent directories as needed.
pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, raw)?;
    Ok(())
}
