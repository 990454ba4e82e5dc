//! Two-tier schema cache
//!
//! In-memory tier keyed by `"{provider_name}:{16-hex config hash}"`, backed
//! by a persistent JSON document that survives process restarts. Entries are
//! immutable except for whole-entry replacement.
//!
//! URL-based entries with neither tools nor prompts are never persisted —
//! they usually signal an auth failure, and caching them would suppress
//! the retry. Command-based providers may legitimately declare zero tools,
//! so those are cached terminally.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{ProviderConfig, cache_key, config_hash};
use crate::protocol::{PromptDescriptor, ToolDescriptor};
use crate::schema::typed_api_text;

/// A cached provider schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSchema {
    /// Declared tools
    pub tools: Vec<ToolDescriptor>,
    /// Declared prompts
    pub prompts: Vec<PromptDescriptor>,
    /// Typed API text synthesized from the tools
    pub typed_api_text: String,
    /// Config hash the entry was keyed under
    pub config_hash: String,
    /// When the schema was fetched
    pub cached_at: DateTime<Utc>,
}

/// On-disk shape of the persistent tier
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    entries: HashMap<String, CachedSchema>,
}

/// Two-tier schema cache
pub struct SchemaCache {
    /// In-memory tier
    memory: DashMap<String, CachedSchema>,
    /// Persistent document path
    store_path: PathBuf,
    /// Serializes read-modify-write cycles on the persistent document
    store_lock: Mutex<()>,
}

impl SchemaCache {
    /// Create a cache persisting to `store_path`
    #[must_use]
    pub fn new(store_path: PathBuf) -> Self {
        Self {
            memory: DashMap::new(),
            store_path,
            store_lock: Mutex::new(()),
        }
    }

    /// Look up a schema for `(provider_name, config)`.
    ///
    /// Memory first; on a miss — or an in-memory hit with neither tools
    /// nor prompts for a URL-based provider — the persistent tier is
    /// consulted. A persistent entry with no tools and no prompts is
    /// treated as stale and purged. A non-empty persistent entry is
    /// promoted into memory, synthesizing `typed_api_text` when absent.
    #[must_use]
    pub fn lookup(&self, provider_name: &str, config: &ProviderConfig) -> Option<CachedSchema> {
        let key = cache_key(provider_name, config);

        if let Some(entry) = self.memory.get(&key) {
            if !entry.tools.is_empty() || !entry.prompts.is_empty() || config.is_command() {
                return Some(entry.clone());
            }
            // Empty schema from a URL-based provider: distrust memory, fall
            // through to the persistent tier.
        }

        let mut entry = self.load_persistent(&key)?;
        if entry.tools.is_empty() && entry.prompts.is_empty() {
            debug!(key = %key, "Purging stale empty persistent entry");
            self.remove_persistent(&key);
            return None;
        }
        if entry.typed_api_text.is_empty() {
            entry.typed_api_text = typed_api_text(&entry.tools);
        }
        self.memory.insert(key, entry.clone());
        Some(entry)
    }

    /// Store a freshly fetched schema.
    ///
    /// Always lands in memory; persisted only when the fetch produced
    /// tools or prompts, or the provider is command-based.
    pub fn store(
        &self,
        provider_name: &str,
        config: &ProviderConfig,
        tools: Vec<ToolDescriptor>,
        prompts: Vec<PromptDescriptor>,
        api_text: String,
    ) -> CachedSchema {
        let key = cache_key(provider_name, config);
        let entry = CachedSchema {
            tools,
            prompts,
            typed_api_text: api_text,
            config_hash: config_hash(provider_name, config),
            cached_at: Utc::now(),
        };

        self.memory.insert(key.clone(), entry.clone());

        if !entry.tools.is_empty() || !entry.prompts.is_empty() || config.is_command() {
            self.write_persistent(&key, &entry);
        } else {
            debug!(key = %key, "Empty URL-based schema kept in memory only");
        }
        entry
    }

    /// Drop the in-memory entry for an unloaded instance; the persistent
    /// tier keeps serving restarts.
    pub fn evict_memory(&self, provider_name: &str, config: &ProviderConfig) {
        self.memory.remove(&cache_key(provider_name, config));
    }

    /// Explicitly invalidate both tiers for `(provider_name, config)`
    pub fn invalidate(&self, provider_name: &str, config: &ProviderConfig) {
        let key = cache_key(provider_name, config);
        self.memory.remove(&key);
        self.remove_persistent(&key);
    }

    /// Number of in-memory entries
    #[must_use]
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    // ── persistent tier ───────────────────────────────────────────────

    fn read_document(&self) -> StoreDocument {
        let Ok(raw) = std::fs::read_to_string(&self.store_path) else {
            return StoreDocument::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(path = %self.store_path.display(), error = %e, "Malformed schema store, starting fresh");
            StoreDocument::default()
        })
    }

    fn write_document(&self, doc: &StoreDocument) {
        if let Some(parent) = self.store_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(doc) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.store_path, raw) {
                    warn!(path = %self.store_path.display(), error = %e, "Failed to write schema store");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize schema store"),
        }
    }

    fn load_persistent(&self, key: &str) -> Option<CachedSchema> {
        let _guard = self.store_lock.lock();
        self.read_document().entries.remove(key)
    }

    fn write_persistent(&self, key: &str, entry: &CachedSchema) {
        let _guard = self.store_lock.lock();
        let mut doc = self.read_document();
        doc.entries.insert(key.to_string(), entry.clone());
        self.write_document(&doc);
    }

    fn remove_persistent(&self, key: &str) {
        let _guard = self.store_lock.lock();
        let mut doc = self.read_document();
        if doc.entries.remove(key).is_some() {
            self.write_document(&doc);
        }
    }
}
