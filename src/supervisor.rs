//! The sandbox supervisor
//!
//! Top-level object binding provider lifecycle, the schema cache, the
//! policy registry, the RPC bridge, and the sandbox host into one
//! failure-tolerant pipeline. User code never runs in this process; it is
//! always confined to the sandbox host's isolate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bridge::RpcBridge;
use crate::cache::SchemaCache;
use crate::codegen::{generate_worker_program, worker_id};
use crate::config::{Config, ProviderConfig};
use crate::metrics::{ExecutionMetrics, ExecutionResult, SchemaEfficiency, SecurityMetrics};
use crate::policy::PolicyRegistry;
use crate::process::ProcessRegistry;
use crate::protocol::{PromptDescriptor, ToolDescriptor};
use crate::provider::ProviderSession;
use crate::sandbox::SandboxHost;
use crate::schema::typed_api_text;
use crate::security::screen_user_code;
use crate::settings::default_settings_path;
use crate::{Error, Result};

/// Hard deadline for shutdown; whatever has not closed by then is abandoned
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Instance lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Session opening / schema materializing
    Initializing,
    /// Accepting executions
    Ready,
    /// Load failed after registration
    Error,
    /// Unloaded
    Stopped,
}

/// Internal instance record, exclusively owned by the supervisor
struct InstanceRecord {
    id: String,
    name: String,
    status: RwLock<InstanceStatus>,
    config: ProviderConfig,
    tools: RwLock<Vec<ToolDescriptor>>,
    prompts: RwLock<Vec<PromptDescriptor>>,
    typed_api_text: RwLock<String>,
    created_at: DateTime<Utc>,
    created_instant: Instant,
}

/// Public snapshot of a provider instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInstance {
    /// Fresh UUID assigned at load; the address for every later call
    pub id: String,
    /// User-facing provider name
    pub name: String,
    /// Lifecycle status
    pub status: InstanceStatus,
    /// Declared tools
    pub tools: Vec<ToolDescriptor>,
    /// Declared prompts
    pub prompts: Vec<PromptDescriptor>,
    /// Typed API text for the tool set
    pub typed_api_text: String,
    /// Load timestamp
    pub created_at: DateTime<Utc>,
    /// Milliseconds since load, computed at read time
    pub uptime_ms: u64,
}

impl InstanceRecord {
    fn snapshot(&self) -> ProviderInstance {
        ProviderInstance {
            id: self.id.clone(),
            name: self.name.clone(),
            status: *self.status.read(),
            tools: self.tools.read().clone(),
            prompts: self.prompts.read().clone(),
            typed_api_text: self.typed_api_text.read().clone(),
            created_at: self.created_at,
            uptime_ms: u64::try_from(self.created_instant.elapsed().as_millis())
                .unwrap_or(u64::MAX),
        }
    }
}

/// The sandbox supervisor
pub struct Supervisor {
    config: Config,
    instances: DashMap<String, Arc<InstanceRecord>>,
    sessions: Arc<DashMap<String, Arc<ProviderSession>>>,
    cache: SchemaCache,
    policies: PolicyRegistry,
    bridge: tokio::sync::Mutex<RpcBridge>,
    sandbox: SandboxHost,
    processes: Arc<ProcessRegistry>,
    tool_rpc_url: String,
    fetch_proxy_url: String,
}

impl Supervisor {
    /// Construct the supervisor: start the RPC bridge, spawn the sandbox
    /// host, and wire the cache and policy registry.
    pub async fn new(config: Config) -> Result<Self> {
        let sessions: Arc<DashMap<String, Arc<ProviderSession>>> = Arc::new(DashMap::new());
        let bridge = RpcBridge::start(Arc::clone(&sessions)).await?;
        let tool_rpc_url = bridge.tool_rpc_url();
        let fetch_proxy_url = bridge.fetch_proxy_url();

        let processes = Arc::new(ProcessRegistry::new());
        let sandbox = SandboxHost::start(config.sandbox.clone(), &processes).await?;

        let settings_path = config
            .settings_path
            .as_ref()
            .map_or_else(default_settings_path, PathBuf::from);
        let cache_path = config.schema_cache_path.as_ref().map_or_else(
            || {
                default_settings_path()
                    .parent()
                    .map(|dir| dir.join("schema-cache.json"))
                    .unwrap_or_else(|| PathBuf::from("schema-cache.json"))
            },
            PathBuf::from,
        );

        Ok(Self {
            config,
            instances: DashMap::new(),
            sessions,
            cache: SchemaCache::new(cache_path),
            policies: PolicyRegistry::new(settings_path),
            bridge: tokio::sync::Mutex::new(bridge),
            sandbox,
            processes,
            tool_rpc_url,
            fetch_proxy_url,
        })
    }

    /// Load a provider: open a session, materialize its schema (cache
    /// first), and register a fresh instance.
    ///
    /// A prior instance under the same name may coexist; each load gets a
    /// fresh id. Failure to fetch a schema rolls back everything: the
    /// spawned child is terminated, the half-open transport closed, and the
    /// call fails with a connection error.
    pub async fn load_provider(
        &self,
        name: &str,
        config: ProviderConfig,
    ) -> Result<ProviderInstance> {
        let id = Uuid::new_v4().to_string();
        info!(provider = name, id = %id, "Loading provider");

        let record = Arc::new(InstanceRecord {
            id: id.clone(),
            name: name.to_string(),
            status: RwLock::new(InstanceStatus::Initializing),
            config: config.clone(),
            tools: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
            typed_api_text: RwLock::new(String::new()),
            created_at: Utc::now(),
            created_instant: Instant::now(),
        });
        self.instances.insert(id.clone(), Arc::clone(&record));

        match self.load_inner(&id, name, &config, &record).await {
            Ok(()) => {
                *record.status.write() = InstanceStatus::Ready;
                Ok(record.snapshot())
            }
            Err(e) => {
                // Roll back all partial state for this load.
                self.instances.remove(&id);
                if let Some((_, session)) = self.sessions.remove(&id) {
                    if let Some(pid) = session.child_pid() {
                        self.processes.untrack(pid);
                    }
                    let _ = session.close().await;
                }
                Err(e)
            }
        }
    }

    async fn load_inner(
        &self,
        id: &str,
        name: &str,
        config: &ProviderConfig,
        record: &InstanceRecord,
    ) -> Result<()> {
        let cached = self.cache.lookup(name, config);

        let session = Arc::new(
            ProviderSession::connect(name, config, self.config.limits.connect_timeout).await?,
        );
        if let Some(pid) = session.child_pid() {
            self.processes.track(pid);
        }
        self.sessions.insert(id.to_string(), Arc::clone(&session));

        let schema = if let Some(entry) = cached {
            info!(provider = name, "Schema served from cache");
            entry
        } else {
            let tools = session.list_tools().await?;
            let prompts = session.list_prompts().await?;
            let api = typed_api_text(&tools);
            self.cache.store(name, config, tools, prompts, api)
        };

        *record.tools.write() = schema.tools;
        *record.prompts.write() = schema.prompts;
        *record.typed_api_text.write() = schema.typed_api_text;
        Ok(())
    }

    /// Execute a user snippet in the sandbox against a loaded provider.
    ///
    /// Failures inside the execution surface as `success=false` results;
    /// only supervisor-level invariant violations (unknown id, instance not
    /// ready, sandbox host unreachable) raise.
    pub async fn execute_in_sandbox(
        &self,
        id_or_name: &str,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let record = self
            .find_instance(id_or_name)
            .ok_or_else(|| Error::worker(format!("unknown instance: {id_or_name}")))?;
        if *record.status.read() != InstanceStatus::Ready {
            return Err(Error::worker(format!(
                "instance '{}' is not ready (status: {:?})",
                record.id,
                *record.status.read()
            )));
        }

        screen_user_code(code, self.config.limits.max_code_len)?;

        let timeout = timeout.unwrap_or(self.config.limits.default_timeout);
        let policy = self.policies.resolve(&record.name);
        let tools = record.tools.read().clone();
        let api_text = record.typed_api_text.read().clone();

        let program = generate_worker_program(
            &record.id,
            &tools,
            &api_text,
            code,
            &policy,
            &self.tool_rpc_url,
            &self.fetch_proxy_url,
        );
        let wid = worker_id(&record.id, code);

        let started = Instant::now();
        let outcome = self.sandbox.execute(&wid, &program, code, timeout).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let security = SecurityMetrics::from_policy(&policy);
        match outcome {
            Ok(worker) => {
                let efficiency = SchemaEfficiency::compute(&tools, &worker.metrics.tools_called);
                let mut error_details = None;
                if let Some(stack) = worker.stack {
                    let mut details = HashMap::new();
                    details.insert("stack".to_string(), stack);
                    error_details = Some(details);
                }
                Ok(ExecutionResult {
                    success: worker.success,
                    output: worker.output,
                    result: worker.result,
                    error: worker.error,
                    execution_time_ms: elapsed_ms,
                    metrics: ExecutionMetrics {
                        tool_calls_made: worker.metrics.tool_calls_made,
                        tools_called: worker.metrics.tools_called,
                        schema_efficiency: efficiency,
                        security,
                    },
                    error_details,
                })
            }
            Err(Error::Sandbox {
                code: err_code,
                message,
                status,
            }) => {
                // Host rejected the execution; still a well-formed result.
                let mut details = HashMap::new();
                details.insert("code".to_string(), err_code);
                if let Some(status) = status {
                    details.insert("status".to_string(), status.to_string());
                }
                Ok(ExecutionResult::failure(
                    message,
                    String::new(),
                    elapsed_ms,
                    ExecutionMetrics {
                        tool_calls_made: 0,
                        tools_called: Vec::new(),
                        schema_efficiency: SchemaEfficiency::compute(&tools, &[]),
                        security,
                    },
                    Some(details),
                ))
            }
            Err(other) => Err(other),
        }
    }

    /// Unload a provider instance.
    ///
    /// Closes the transport, terminates the owned child process tree, clears
    /// the in-memory cache entry, and removes the instance. Unloading a
    /// nonexistent id fails with a worker error.
    pub async fn unload_provider(&self, id: &str) -> Result<()> {
        let Some((_, record)) = self.instances.remove(id) else {
            return Err(Error::worker(format!("unknown instance: {id}")));
        };
        info!(provider = %record.name, id = %id, "Unloading provider");
        *record.status.write() = InstanceStatus::Stopped;

        if let Some((_, session)) = self.sessions.remove(id) {
            if let Some(pid) = session.child_pid() {
                self.processes.untrack(pid);
            }
            if let Err(e) = session.close().await {
                warn!(id = %id, error = %e, "Session close reported an error");
            }
        }

        self.cache.evict_memory(&record.name, &record.config);
        Ok(())
    }

    /// The bridge URL workers use for tool invocations
    #[must_use]
    pub fn tool_rpc_url(&self) -> &str {
        &self.tool_rpc_url
    }

    /// The policy-enforcing outbound channel URL
    #[must_use]
    pub fn fetch_proxy_url(&self) -> &str {
        &self.fetch_proxy_url
    }

    /// Snapshot every instance, uptime computed at read time
    #[must_use]
    pub fn list_instances(&self) -> Vec<ProviderInstance> {
        let mut instances: Vec<ProviderInstance> = self
            .instances
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        instances
    }

    /// Snapshot one instance by id
    #[must_use]
    pub fn get_instance(&self, id: &str) -> Option<ProviderInstance> {
        self.instances.get(id).map(|entry| entry.value().snapshot())
    }

    /// Snapshot the most recently loaded instance under `name`
    #[must_use]
    pub fn get_instance_by_name(&self, name: &str) -> Option<ProviderInstance> {
        self.instances
            .iter()
            .filter(|entry| entry.value().name == name)
            .max_by_key(|entry| entry.value().created_at)
            .map(|entry| entry.value().snapshot())
    }

    fn find_instance(&self, id_or_name: &str) -> Option<Arc<InstanceRecord>> {
        if let Some(entry) = self.instances.get(id_or_name) {
            return Some(Arc::clone(entry.value()));
        }
        self.instances
            .iter()
            .filter(|entry| entry.value().name == id_or_name)
            .max_by_key(|entry| entry.value().created_at)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Shut everything down: close the bridge listener, then concurrently
    /// close all provider sessions and terminate the sandbox host and every
    /// tracked child, bounded by a fixed deadline after which remaining
    /// resources are abandoned.
    pub async fn shutdown(&self) {
        info!("Supervisor shutting down");
        self.bridge.lock().await.shutdown().await;

        for entry in &self.instances {
            *entry.value().status.write() = InstanceStatus::Stopped;
        }

        let close_sessions = async {
            let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
            let sessions: Vec<Arc<ProviderSession>> = ids
                .iter()
                .filter_map(|id| self.sessions.remove(id).map(|(_, s)| s))
                .collect();
            futures::future::join_all(sessions.iter().map(|s| s.close())).await;
        };

        let teardown = async {
            tokio::join!(
                close_sessions,
                self.sandbox.shutdown(&self.processes),
            );
            self.processes.terminate_all().await;
        };

        if tokio::time::timeout(SHUTDOWN_DEADLINE, teardown).await.is_err() {
            warn!("Shutdown deadline elapsed; abandoning remaining resources");
        }
        self.instances.clear();
    }
}
