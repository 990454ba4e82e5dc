//! Cross-module tests: settings document on disk through the policy
//! registry to a normalized policy.

use mcp_airlock::policy::{Policy, PolicyRegistry, is_host_allowed};
use mcp_airlock::settings::{Settings, load_settings, save_settings};
use pretty_assertions::assert_eq;

fn registry_with(dir: &tempfile::TempDir, raw: &str) -> PolicyRegistry {
    let path = dir.path().join("settings.json");
    std::fs::write(&path, raw).unwrap();
    PolicyRegistry::new(path)
}

#[test]
fn guarded_entry_resolves_normalized_allowlist() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(
        &dir,
        r#"{
            "enabled": true,
            "mcpConfigs": [{
                "id": "1",
                "mcpName": "github",
                "isGuarded": true,
                "network": {
                    "enabled": true,
                    "allowlist": ["API.GitHub.COM.", "*.Example.ORG"],
                    "allowLocalhost": false
                }
            }]
        }"#,
    );

    let policy = registry.resolve("github");
    assert!(policy.guarded);
    assert_eq!(
        policy.outbound.allowed_hosts,
        Some(vec![
            "api.github.com".to_string(),
            "*.example.org".to_string()
        ])
    );

    let hosts = policy.outbound.allowed_hosts.unwrap();
    assert!(is_host_allowed("api.github.com", &hosts));
    assert!(is_host_allowed("sub.example.org", &hosts));
    assert!(!is_host_allowed("example.org", &hosts));
}

#[test]
fn global_switch_off_means_nothing_is_guarded() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(
        &dir,
        r#"{
            "enabled": false,
            "mcpConfigs": [{"id": "1", "mcpName": "github", "isGuarded": true}]
        }"#,
    );
    assert_eq!(registry.resolve("github"), Policy::unguarded());
}

#[test]
fn malformed_settings_resolve_to_unguarded_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry_with(&dir, "{broken json!");
    let policy = registry.resolve("anything");
    assert_eq!(policy, Policy::unguarded());
    assert!(!policy.egress_enabled());
}

#[test]
fn missing_settings_file_resolves_to_unguarded_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let registry = PolicyRegistry::new(dir.path().join("absent.json"));
    assert_eq!(registry.resolve("github"), Policy::unguarded());
}

#[test]
fn settings_edits_take_effect_without_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(&path, r#"{"enabled": false}"#).unwrap();
    let registry = PolicyRegistry::new(path.clone());
    assert!(!registry.resolve("github").guarded);

    std::fs::write(
        &path,
        r#"{"enabled": true, "mcpConfigs": [{"id": "1", "mcpName": "github", "isGuarded": true}]}"#,
    )
    .unwrap();
    assert!(registry.resolve("github").guarded);
}

#[test]
fn settings_roundtrip_preserves_loaded_document() {
    let dir = tempfile::tempdir().unwrap();
    let original = dir.path().join("original.json");
    std::fs::write(
        &original,
        r#"{
            "enabled": true,
            "defaults": {
                "network": {"enabled": true, "allowlist": ["a.example"], "allowLocalhost": true},
                "resourceLimits": {"maxExecutionTimeMs": 5000, "maxMemoryMB": 64, "maxMCPCalls": 10}
            },
            "mcpConfigs": [{"id": "7", "mcpName": "fs", "isGuarded": true}]
        }"#,
    )
    .unwrap();

    let loaded = load_settings(&original);
    let copy = dir.path().join("copy.json");
    save_settings(&copy, &loaded).unwrap();
    let reloaded = load_settings(&copy);

    assert_eq!(loaded, reloaded);
    assert_eq!(reloaded.defaults.resource_limits.max_execution_time_ms, 5000);
    assert_eq!(reloaded.defaults.network.allowlist, vec!["a.example"]);
}

#[test]
fn default_document_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("defaults.json");
    save_settings(&path, &Settings::default()).unwrap();
    assert_eq!(load_settings(&path), Settings::default());
}
