//! Core of the xiaozhi MCP multiplexing proxy: supervises a configurable
//! set of upstream MCP services, aggregates their tools into one namespaced
//! catalog, and re-exports that catalog to downstream WebSocket endpoints.
//!
//! This crate is the engine only — it has no binary entry point, no CLI,
//! and does not call [`logging::init_tracing`] on its own. An embedding
//! binary constructs an [`McpProxy`], wires up logging, and drives its
//! lifecycle.

pub mod config;
pub mod custom;
pub mod endpoint;
pub mod events;
pub mod handler;
pub mod logging;
pub mod registry;
pub mod supervisor;
pub mod types;
pub mod upstream;

pub use types::ProxyError;

use config::XiaozhiConfig;
use custom::{CUSTOM_SERVICE_NAME, CustomToolHandler};
use endpoint::EndpointManager;
use events::EventBus;
use handler::McpMessageHandler;
use registry::{SharedToolRegistry, ToolRegistry, spawn_tool_call_logger};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use supervisor::ServiceSupervisor;

/// Top-level facade wiring the event bus, registry, custom-tool handler,
/// upstream supervisor, message handler, and downstream endpoint manager
/// into one running proxy.
pub struct McpProxy {
    pub events: EventBus,
    pub registry: SharedToolRegistry,
    pub supervisor: Arc<ServiceSupervisor>,
    pub custom: Arc<CustomToolHandler>,
    pub endpoints: Arc<EndpointManager<McpMessageHandler>>,
}

impl McpProxy {
    /// Build and start a proxy from a parsed config document. `state_dir`
    /// holds the on-disk tool cache (`xiaozhi.cache.json`) and the
    /// tool-call log.
    pub async fn start(config: XiaozhiConfig, state_dir: impl AsRef<Path>) -> Self {
        let state_dir: PathBuf = state_dir.as_ref().to_path_buf();
        let events = EventBus::new();

        let (logger, _log_task) = spawn_tool_call_logger(state_dir.join("tool-calls.ndjson"));
        let registry: SharedToolRegistry = Arc::new(ToolRegistry::new(events.clone(), state_dir.join("xiaozhi.cache.json"), logger));
        registry.seed_from_cache().await;

        let coze_token = config.platforms.coze.token.clone();
        let custom = Arc::new(CustomToolHandler::new(config.custom_mcp.tools.clone(), coze_token));
        registry.register_service(CUSTOM_SERVICE_NAME, custom.to_registry_tools(), None).await;

        let supervisor = Arc::new(ServiceSupervisor::new(Arc::clone(&registry), events.clone()));
        for (name, entry) in &config.mcp_servers {
            match config::resolve_service_config(name, entry) {
                Ok(service_config) => {
                    let tool_settings = registry::tool_settings_for(&config, name).cloned();
                    supervisor.add_service_config(service_config, tool_settings).await;
                }
                Err(err) => {
                    tracing::warn!(service = name, error = %err, "skipping service with unresolvable transport");
                }
            }
        }

        let message_handler = Arc::new(McpMessageHandler::new(Arc::clone(&registry), Arc::clone(&supervisor), Arc::clone(&custom)));
        let endpoints = Arc::new(EndpointManager::new(message_handler));
        endpoints.start(config.mcp_endpoint.clone()).await;

        Self {
            events,
            registry,
            supervisor,
            custom,
            endpoints,
        }
    }

    /// Stop every downstream endpoint session, then every upstream service.
    pub async fn shutdown(&self) {
        self.endpoints.stop_all().await;
        self.supervisor.stop_all().await;
    }
}
