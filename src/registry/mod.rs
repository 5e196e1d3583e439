//! Tool registry: the authoritative `namespacedName -> Tool` map, with a
//! per-service index, enable/disable filtering, and usage accounting.

pub mod cache;
pub mod log;

pub use cache::{CacheError, load_cache, save_cache};
pub use log::{ToolCallLogger, spawn_tool_call_logger};

use crate::config::{ToolSettings, XiaozhiConfig};
use crate::events::{EventBus, names};
use crate::types::{CachedServiceEntry, CachedToolCatalog, Tool};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Which tools `list()` should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    Enabled,
    Disabled,
    All,
}

/// Sort key for `list()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Name,
    Enabled,
    UsageCount,
    LastUsedTime,
}

struct Inner {
    tools: BTreeMap<String, Tool>,
    by_service: BTreeMap<String, Vec<String>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            by_service: BTreeMap::new(),
        }
    }
}

/// Owns the live tool catalog and persists it to `xiaozhi.cache.json` on
/// every successful `registerService`.
pub struct ToolRegistry {
    inner: Mutex<Inner>,
    events: EventBus,
    cache_path: std::path::PathBuf,
    logger: ToolCallLogger,
}

impl ToolRegistry {
    pub fn new(events: EventBus, cache_path: std::path::PathBuf, logger: ToolCallLogger) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            events,
            cache_path,
            logger,
        }
    }

    /// Seed the registry from the on-disk cache at startup, before any
    /// upstream has finished its handshake. Cached tools are marked
    /// `enabled=false` implicitly for routing purposes: callers must check
    /// the owning service's live connection state before dispatching
    /// (`ServiceNotReady` until the service actually connects), per the
    /// registry's contract in the component design.
    pub async fn seed_from_cache(&self) {
        match load_cache(&self.cache_path).await {
            Ok(catalog) => {
                let mut inner = self.inner.lock().await;
                for (service_name, entry) in catalog.services {
                    let names: Vec<String> = entry.tools.iter().map(|t| t.name.clone()).collect();
                    for tool in entry.tools {
                        inner.tools.insert(tool.name.clone(), tool);
                    }
                    inner.by_service.insert(service_name, names);
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "no usable tool cache on startup; starting empty");
            }
        }
    }

    /// Atomically replace a service's contribution to the registry,
    /// applying per-tool enable/disable settings from config, then
    /// best-effort persist the updated catalog to disk.
    pub async fn register_service(&self, service_name: &str, mut tools: Vec<Tool>, tool_settings: Option<&BTreeMap<String, ToolSettings>>) {
        for tool in &mut tools {
            if let Some(settings) = tool_settings.and_then(|m| m.get(&tool.original_name)) {
                tool.enabled = settings.enable;
                if let Some(usage) = settings.usage_count.checked_sub(0) {
                    tool.usage_count = tool.usage_count.max(usage);
                }
            }
        }

        tools.sort_by(|a, b| a.name.cmp(&b.name));

        let catalog_snapshot = {
            let mut inner = self.inner.lock().await;

            if let Some(previous_names) = inner.by_service.remove(service_name) {
                for name in previous_names {
                    inner.tools.remove(&name);
                }
            }

            let names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
            for tool in tools {
                inner.tools.insert(tool.name.clone(), tool);
            }
            inner.by_service.insert(service_name.to_string(), names);

            self.snapshot_locked(&inner)
        };

        self.events.emit(
            names::SERVER_BATCH_ADDED,
            serde_json::json!({ "serviceName": service_name, "toolCount": catalog_snapshot.services.get(service_name).map(|e| e.tools.len()).unwrap_or(0) }),
        );
        self.events.emit(names::SERVER_ADDED, serde_json::json!({ "serviceName": service_name }));

        if let Err(err) = save_cache(&self.cache_path, &catalog_snapshot).await {
            tracing::warn!(error = %err, "failed to persist tool cache");
        }
    }

    /// Remove all tools contributed by `service_name`.
    pub async fn unregister_service(&self, service_name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(names) = inner.by_service.remove(service_name) {
            for name in names {
                inner.tools.remove(&name);
            }
        }
        drop(inner);
        self.events.emit(names::SERVER_REMOVED, serde_json::json!({ "serviceName": service_name }));
    }

    pub async fn resolve(&self, namespaced_name: &str) -> Option<Tool> {
        self.inner.lock().await.tools.get(namespaced_name).cloned()
    }

    pub async fn list(&self, filter: ListFilter, sort_by: SortBy) -> Vec<Tool> {
        let inner = self.inner.lock().await;
        let mut tools: Vec<Tool> = inner
            .tools
            .values()
            .filter(|t| match filter {
                ListFilter::Enabled => t.enabled,
                ListFilter::Disabled => !t.enabled,
                ListFilter::All => true,
            })
            .cloned()
            .collect();

        match sort_by {
            SortBy::Name => tools.sort_by(|a, b| a.name.cmp(&b.name)),
            SortBy::Enabled => tools.sort_by(|a, b| b.enabled.cmp(&a.enabled)),
            SortBy::UsageCount => tools.sort_by(|a, b| b.usage_count.cmp(&a.usage_count)),
            SortBy::LastUsedTime => tools.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at)),
        }

        tools
    }

    /// Record a completed call: bump `usageCount`/`lastUsedAt` and append a
    /// line to the tool-call log.
    pub async fn record_call(
        &self,
        namespaced_name: &str,
        arguments: serde_json::Value,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
        result_summary: Option<String>,
    ) {
        let record = {
            let mut inner = self.inner.lock().await;
            let Some(tool) = inner.tools.get_mut(namespaced_name) else {
                return;
            };
            tool.record_call();

            crate::types::ToolCallRecord {
                timestamp: chrono::Utc::now(),
                tool_name: tool.name.clone(),
                original_name: tool.original_name.clone(),
                service_name: tool.service_name.clone(),
                arguments,
                success,
                duration_ms,
                error,
                result_summary,
            }
        };

        self.logger.log(record);
    }

    fn snapshot_locked(&self, inner: &Inner) -> CachedToolCatalog {
        let mut catalog = CachedToolCatalog::empty();
        for (service_name, tool_names) in &inner.by_service {
            let tools: Vec<Tool> = tool_names.iter().filter_map(|n| inner.tools.get(n)).cloned().collect();
            catalog.services.insert(
                service_name.clone(),
                CachedServiceEntry {
                    tools,
                    captured_at: chrono::Utc::now(),
                },
            );
        }
        catalog.metadata.total_writes += 1;
        catalog
    }
}

/// Look up per-tool settings for a service from the parsed config document.
pub fn tool_settings_for<'a>(config: &'a XiaozhiConfig, service_name: &str) -> Option<&'a BTreeMap<String, ToolSettings>> {
    config.mcp_server_config.get(service_name)
}

pub type SharedToolRegistry = Arc<ToolRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tool;

    async fn registry() -> ToolRegistry {
        let dir = tempfile::tempdir().unwrap();
        let (logger, _handle) = spawn_tool_call_logger(dir.path().join("calls.ndjson"));
        ToolRegistry::new(EventBus::new(), dir.path().join("xiaozhi.cache.json"), logger)
    }

    #[tokio::test]
    async fn register_then_unregister_restores_empty_state() {
        let registry = registry().await;
        let tools = vec![Tool::new("calc", "add", "adds".into(), serde_json::json!({}))];
        registry.register_service("calc", tools, None).await;
        assert_eq!(registry.list(ListFilter::All, SortBy::Name).await.len(), 1);

        registry.unregister_service("calc").await;
        assert!(registry.list(ListFilter::All, SortBy::Name).await.is_empty());
    }

    #[tokio::test]
    async fn register_service_applies_disable_setting() {
        let registry = registry().await;
        let tools = vec![Tool::new("calc", "add", "adds".into(), serde_json::json!({}))];
        let mut settings = BTreeMap::new();
        settings.insert(
            "add".to_string(),
            ToolSettings {
                enable: false,
                description: None,
                usage_count: 0,
                last_used_time: None,
            },
        );

        registry.register_service("calc", tools, Some(&settings)).await;
        assert!(registry.list(ListFilter::Enabled, SortBy::Name).await.is_empty());
        assert_eq!(registry.list(ListFilter::All, SortBy::Name).await.len(), 1);
    }

    #[tokio::test]
    async fn re_register_replaces_rather_than_appends() {
        let registry = registry().await;
        let tools = vec![Tool::new("calc", "add", "adds".into(), serde_json::json!({}))];
        registry.register_service("calc", tools.clone(), None).await;
        registry.register_service("calc", tools, None).await;
        assert_eq!(registry.list(ListFilter::All, SortBy::Name).await.len(), 1);
    }

    #[tokio::test]
    async fn record_call_increments_usage_and_logs() {
        let registry = registry().await;
        let tools = vec![Tool::new("calc", "add", "adds".into(), serde_json::json!({}))];
        registry.register_service("calc", tools, None).await;

        registry
            .record_call("calc__add", serde_json::json!({"a":1}), true, 5, None, Some("3".into()))
            .await;

        let tool = registry.resolve("calc__add").await.unwrap();
        assert_eq!(tool.usage_count, 1);
        assert!(tool.last_used_at.is_some());
    }
}
