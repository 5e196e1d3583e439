//! Shared data model: transports, tools, service/endpoint state, and the
//! on-disk catalog and log record shapes.

mod errors;

pub use errors::ProxyError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The three upstream transports the proxy knows how to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

/// The fixed separator between a service name and a tool's original name
/// in the namespaced form seen by downstream callers.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Build the namespaced wire name for a tool.
pub fn namespaced_name(service_name: &str, original_name: &str) -> String {
    format!("{service_name}{NAMESPACE_SEPARATOR}{original_name}")
}

/// Split a namespaced name back into `(serviceName, originalName)`.
///
/// Splits on the *first* occurrence of the separator, since a service name
/// itself never contains it (enforced at config-validation time) while an
/// original tool name conceivably could.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
}

/// A single upstream's immutable configuration, as resolved from the config
/// file. Distinct from the raw deserialized config model in `config::model`
/// in that transport inference has already happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    pub kind: TransportKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
    pub reconnect_delay_ms: u64,
}

/// A tool aggregated from an upstream, as seen by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Namespaced wire name, `<serviceName>__<originalName>`.
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub service_name: String,
    pub original_name: String,
    pub enabled: bool,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Tool {
    pub fn new(service_name: impl Into<String>, original_name: impl Into<String>, description: String, input_schema: serde_json::Value) -> Self {
        let service_name = service_name.into();
        let original_name = original_name.into();
        let name = namespaced_name(&service_name, &original_name);
        Self {
            name,
            description,
            input_schema,
            service_name,
            original_name,
            enabled: true,
            usage_count: 0,
            last_used_at: None,
        }
    }

    pub fn record_call(&mut self) {
        self.usage_count += 1;
        self.last_used_at = Some(Utc::now());
    }
}

/// Connection lifecycle state for a single upstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Point-in-time connection status for one upstream, as returned by
/// `getStatus()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub service_name: String,
    pub state: ServiceState,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl ConnectionStatus {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            state: ServiceState::Disconnected,
            last_error: None,
            connected_at: None,
            attempts: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ServiceState::Connected
    }
}

/// Lifecycle state of a single downstream WebSocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// A row appended to the tool-call log (NDJSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub original_name: String,
    pub service_name: String,
    pub arguments: serde_json::Value,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub result_summary: Option<String>,
}

/// One service's contribution to the on-disk tool catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedServiceEntry {
    pub tools: Vec<Tool>,
    pub captured_at: DateTime<Utc>,
}

/// Catalog metadata persisted alongside the per-service tool lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogMetadata {
    pub last_global_update: DateTime<Utc>,
    pub total_writes: u64,
    pub created_at: DateTime<Utc>,
}

/// The on-disk `xiaozhi.cache.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedToolCatalog {
    pub version: u32,
    pub services: BTreeMap<String, CachedServiceEntry>,
    pub metadata: CatalogMetadata,
}

impl CachedToolCatalog {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn empty() -> Self {
        let now = Utc::now();
        Self {
            version: Self::CURRENT_VERSION,
            services: BTreeMap::new(),
            metadata: CatalogMetadata {
                last_global_update: now,
                total_writes: 0,
                created_at: now,
            },
        }
    }
}

/// Status of an in-flight or completed custom-tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomToolStatus {
    Pending,
    Completed,
    Failed,
    Timeout,
}

/// An entry in the custom-tool handler's one-shot result cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomToolResult {
    pub result: serde_json::Value,
    pub status: CustomToolStatus,
    pub timestamp: DateTime<Utc>,
    pub ttl_ms: u64,
    pub consumed: bool,
    pub retry_count: u32,
}

impl CustomToolResult {
    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.timestamp);
        age.num_milliseconds() > self.ttl_ms as i64
    }
}

/// Build the wire shape of a successful `tools/call` result: a single text
/// content block plus `isError: false`, matching the `CallToolResult` shape
/// the upstream transports already produce.
pub fn text_result(text: impl Into<String>) -> serde_json::Value {
    serde_json::json!({
        "content": [{ "type": "text", "text": text.into() }],
        "isError": false,
    })
}

/// Build the wire shape of a failed `tools/call` result: `isError: true`
/// with a human-readable text content, per the custom-tool handler's error
/// policy.
pub fn error_result(message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({
        "content": [{ "type": "text", "text": message.into() }],
        "isError": true,
    })
}
