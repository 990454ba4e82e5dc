//! Per-provider security policy
//!
//! The policy registry resolves a provider name to a normalized [`Policy`]
//! by consulting the guard settings document. A provider is *guarded* only
//! when the top-level guard switch is on AND an entry for that provider
//! exists with its guarded flag set.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::settings::{
    FileSystemSettings, NetworkSettings, ResourceLimitSettings, Settings, load_settings,
};

/// Normalized security policy for one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Whether the provider is invoked only through the sandbox
    pub guarded: bool,
    /// Network egress rules
    pub outbound: OutboundPolicy,
    /// Filesystem permissions
    pub filesystem: FilesystemPolicy,
    /// Resource caps (declarative hints to the sandbox host)
    pub limits: ResourceLimits,
}

/// Network egress rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundPolicy {
    /// Allowed hostnames; `None` means no host allowlist
    pub allowed_hosts: Option<Vec<String>>,
    /// Whether loopback targets are reachable
    pub allow_localhost: bool,
}

/// Filesystem permissions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    /// Whether filesystem access is granted at all
    pub enabled: bool,
    /// Readable path prefixes
    pub read_paths: Vec<String>,
    /// Writable path prefixes
    pub write_paths: Vec<String>,
}

/// Resource caps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock CPU budget in milliseconds
    pub cpu_ms: u64,
    /// Memory budget in megabytes
    pub memory_mb: u64,
    /// Cap on tool calls per execution
    pub max_subrequests: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        let defaults = ResourceLimitSettings::default();
        Self {
            cpu_ms: defaults.max_execution_time_ms,
            memory_mb: defaults.max_memory_mb,
            max_subrequests: defaults.max_mcp_calls,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::unguarded()
    }
}

impl Policy {
    /// Policy for a provider with no guard entry: fully isolated sandbox,
    /// no egress, no filesystem, default resource caps.
    #[must_use]
    pub fn unguarded() -> Self {
        Self {
            guarded: false,
            outbound: OutboundPolicy {
                allowed_hosts: None,
                allow_localhost: false,
            },
            filesystem: FilesystemPolicy::default(),
            limits: ResourceLimits::default(),
        }
    }

    /// Whether the worker gets any network egress path at all.
    ///
    /// With no allowlist and no localhost grant the egress shim is not even
    /// installed; outbound stays denied at the runtime level.
    #[must_use]
    pub fn egress_enabled(&self) -> bool {
        self.outbound.allow_localhost
            || self
                .outbound
                .allowed_hosts
                .as_ref()
                .is_some_and(|hosts| !hosts.is_empty())
    }

    /// Normalize in place: hosts lowercased, trailing dots stripped, an
    /// empty allowlist collapsed to `None`. Idempotent.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.outbound.allowed_hosts = self.outbound.allowed_hosts.and_then(|hosts| {
            let hosts: Vec<String> = hosts.iter().map(|h| normalize_host(h)).collect();
            if hosts.is_empty() { None } else { Some(hosts) }
        });
        self
    }
}

/// Lowercase a hostname and strip one trailing dot. Wildcard prefixes
/// (`*.`) survive normalization.
#[must_use]
pub fn normalize_host(host: &str) -> String {
    let lowered = host.trim().to_ascii_lowercase();
    lowered.strip_suffix('.').unwrap_or(&lowered).to_string()
}

/// Whether `host` matches one allowlist entry.
///
/// A single leading `*.` denotes a subdomain wildcard: it matches any host
/// whose labels end with the remaining suffix, but never the bare suffix
/// itself.
#[must_use]
pub fn host_matches(host: &str, entry: &str) -> bool {
    let host = normalize_host(host);
    let entry = normalize_host(entry);

    if let Some(suffix) = entry.strip_prefix("*.") {
        return host != suffix && host.ends_with(&format!(".{suffix}"));
    }
    host == entry
}

/// Whether `host` matches any entry of `allowlist`
#[must_use]
pub fn is_host_allowed(host: &str, allowlist: &[String]) -> bool {
    allowlist.iter().any(|entry| host_matches(host, entry))
}

/// Resolves provider names to policies from the settings document
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    settings_path: PathBuf,
}

impl PolicyRegistry {
    /// Create a registry reading from `settings_path`
    #[must_use]
    pub fn new(settings_path: PathBuf) -> Self {
        Self { settings_path }
    }

    /// Resolve the effective policy for `provider_name`.
    ///
    /// The settings document is re-read on each resolution so edits take
    /// effect without a gateway restart.
    #[must_use]
    pub fn resolve(&self, provider_name: &str) -> Policy {
        let settings = load_settings(&self.settings_path);
        Self::resolve_from(&settings, provider_name)
    }

    /// Resolve against an already-loaded settings document
    #[must_use]
    pub fn resolve_from(settings: &Settings, provider_name: &str) -> Policy {
        let entry = settings
            .mcp_configs
            .iter()
            .find(|entry| entry.mcp_name == provider_name);

        let guarded = settings.enabled && entry.is_some_and(|e| e.is_guarded);
        if !guarded {
            return Policy::unguarded();
        }
        let entry = entry.expect("guarded implies an entry exists");

        let network = entry.network.as_ref().unwrap_or(&settings.defaults.network);
        let file_system = entry
            .file_system
            .as_ref()
            .unwrap_or(&settings.defaults.file_system);
        let limits = entry
            .resource_limits
            .as_ref()
            .unwrap_or(&settings.defaults.resource_limits);

        Policy {
            guarded: true,
            outbound: Self::outbound_from(network),
            filesystem: FilesystemPolicy {
                enabled: file_system.enabled,
                read_paths: file_system.read_paths.clone(),
                write_paths: file_system.write_paths.clone(),
            },
            limits: ResourceLimits {
                cpu_ms: limits.max_execution_time_ms,
                memory_mb: limits.max_memory_mb,
                max_subrequests: limits.max_mcp_calls,
            },
        }
        .normalized()
    }

    fn outbound_from(network: &NetworkSettings) -> OutboundPolicy {
        let allowed_hosts = if network.enabled && !network.allowlist.is_empty() {
            Some(network.allowlist.clone())
        } else {
            None
        };
        OutboundPolicy {
            allowed_hosts,
            allow_localhost: network.allow_localhost,
        }
    }
}

/// Translate raw filesystem settings (used by launch-config import paths)
impl From<&FileSystemSettings> for FilesystemPolicy {
    fn from(value: &FileSystemSettings) -> Self {
        Self {
            enabled: value.enabled,
            read_paths: value.read_paths.clone(),
            write_paths: value.write_paths.clone(),
        }
    }
}
