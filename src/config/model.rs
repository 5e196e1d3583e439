//! Raw configuration document shape, as deserialized from
//! `xiaozhi.config.{json,json5,jsonc}` before transport inference and
//! validation.

use crate::types::{ServiceConfig, TransportKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

fn default_timeout_ms() -> u64 {
    8_000
}

fn default_reconnect_delay_ms() -> u64 {
    30_000
}

/// `mcpServers.<name>` as written in config, before transport inference.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct McpServerEntry {
    pub r#type: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, deserialize_with = "string_map_or_list")]
    pub env: BTreeMap<String, String>,
    pub url: Option<String>,
    #[serde(default, deserialize_with = "string_map_or_list")]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Accepts either `{"KEY": "value"}` or `["KEY=value", ...]`, matching the
/// flexible shape real-world MCP server configs tend to use for env/headers.
fn string_map_or_list<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Map(BTreeMap<String, String>),
        List(Vec<String>),
    }

    match Option::<Flexible>::deserialize(deserializer)? {
        None => Ok(BTreeMap::new()),
        Some(Flexible::Map(m)) => Ok(m),
        Some(Flexible::List(list)) => {
            let mut map = BTreeMap::new();
            for entry in list {
                if let Some((k, v)) = entry.split_once('=') {
                    map.insert(k.to_string(), v.to_string());
                }
            }
            Ok(map)
        }
    }
}

/// Per-tool persisted settings under `mcpServerConfig.<service>.tools.<tool>`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolSettings {
    #[serde(default = "default_true")]
    pub enable: bool,
    pub description: Option<String>,
    #[serde(default)]
    pub usage_count: u64,
    pub last_used_time: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_true() -> bool {
    true
}

/// A `proxy` custom-tool handler, further tagged by `platform`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum ProxyHandler {
    Coze { base_url: String, workflow_id: String },
}

/// The `script` custom-tool handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptHandler {
    pub interpreter: ScriptInterpreter,
    /// Inline script source, mutually exclusive with `path`.
    pub content: Option<String>,
    /// Path to an existing script file, mutually exclusive with `content`.
    pub path: Option<String>,
    #[serde(default = "default_script_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_script_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptInterpreter {
    Node,
    Python,
    Bash,
}

impl ScriptInterpreter {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Node => "js",
            Self::Python => "py",
            Self::Bash => "sh",
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Python => "python3",
            Self::Bash => "bash",
        }
    }
}

/// Tagged union of custom-tool handler declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CustomToolHandlerConfig {
    Proxy(ProxyHandler),
    Script(ScriptHandler),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomToolDecl {
    pub name: String,
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: serde_json::Value,
    #[serde(flatten)]
    pub handler: CustomToolHandlerConfig,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CustomMcpConfig {
    #[serde(default)]
    pub tools: Vec<CustomToolDecl>,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    35_000
}

fn default_endpoint_reconnect_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout: u64,
    #[serde(default = "default_endpoint_reconnect_ms")]
    pub reconnect_interval: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval_ms(),
            heartbeat_timeout: default_heartbeat_timeout_ms(),
            reconnect_interval: default_endpoint_reconnect_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CozePlatformConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlatformsConfig {
    #[serde(default)]
    pub coze: CozePlatformConfig,
}

/// Accepts either a bare string or an array of strings for `mcpEndpoint`.
fn endpoint_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        One(String),
        Many(Vec<String>),
    }

    match Option::<Flexible>::deserialize(deserializer)? {
        None => Ok(Vec::new()),
        Some(Flexible::One(s)) => Ok(vec![s]),
        Some(Flexible::Many(v)) => Ok(v),
    }
}

/// The full `xiaozhi.config.json` document shape consumed by the core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct XiaozhiConfig {
    #[serde(default, rename = "mcpEndpoint", deserialize_with = "endpoint_list")]
    pub mcp_endpoint: Vec<String>,
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: BTreeMap<String, McpServerEntry>,
    #[serde(default, rename = "mcpServerConfig")]
    pub mcp_server_config: BTreeMap<String, BTreeMap<String, ToolSettings>>,
    // Config files spell this `customMCP`, not the `customMcp` a plain
    // camelCase rename would produce.
    #[serde(default, rename = "customMCP")]
    pub custom_mcp: CustomMcpConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub platforms: PlatformsConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid service '{name}': {reason}")]
    InvalidService { name: String, reason: String },

    #[error("duplicate service name: {name}")]
    DuplicateService { name: String },

    #[error("custom tool '{name}' declares an unrecognized handler variant")]
    UnknownHandler { name: String },
}

/// Infer the transport for one `mcpServers` entry per the fixed rule:
/// `command` present ⇒ stdio; URL path ending `/sse` (case-sensitive, query
/// ignored) ⇒ sse; otherwise ⇒ streamable-http. An explicit `type` field
/// short-circuits inference.
pub fn infer_transport(entry: &McpServerEntry) -> Result<TransportKind, ConfigError> {
    if let Some(explicit) = entry.r#type.as_deref() {
        return match explicit {
            "stdio" => Ok(TransportKind::Stdio),
            "sse" => Ok(TransportKind::Sse),
            "streamable-http" | "streamableHttp" => Ok(TransportKind::StreamableHttp),
            other => Err(ConfigError::InvalidService {
                name: String::new(),
                reason: format!("unknown transport type '{other}'"),
            }),
        };
    }

    if entry.command.is_some() {
        return Ok(TransportKind::Stdio);
    }

    if let Some(url) = &entry.url {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.clone());
        if path.ends_with("/sse") {
            return Ok(TransportKind::Sse);
        }
        return Ok(TransportKind::StreamableHttp);
    }

    Err(ConfigError::InvalidService {
        name: String::new(),
        reason: "neither `command` nor `url` is set; cannot infer transport".to_string(),
    })
}

/// Resolve a raw `mcpServers` entry into the immutable [`ServiceConfig`]
/// consumed by the supervisor and upstream clients.
pub fn resolve_service_config(name: &str, entry: &McpServerEntry) -> Result<ServiceConfig, ConfigError> {
    let kind = infer_transport(entry).map_err(|e| match e {
        ConfigError::InvalidService { reason, .. } => ConfigError::InvalidService {
            name: name.to_string(),
            reason,
        },
        other => other,
    })?;

    Ok(ServiceConfig {
        name: name.to_string(),
        kind,
        command: entry.command.clone(),
        args: entry.args.clone(),
        env: entry.env.clone(),
        url: entry.url.clone(),
        headers: entry.headers.clone(),
        timeout_ms: entry.timeout_ms,
        reconnect_delay_ms: entry.reconnect_delay_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_stdio_from_command() {
        let entry = McpServerEntry {
            command: Some("node".into()),
            ..Default::default()
        };
        assert_eq!(infer_transport(&entry).unwrap(), TransportKind::Stdio);
    }

    #[test]
    fn infers_sse_from_url_suffix_case_sensitive() {
        let entry = McpServerEntry {
            url: Some("https://example.com/mcp/sse?x=1".into()),
            ..Default::default()
        };
        assert_eq!(infer_transport(&entry).unwrap(), TransportKind::Sse);

        let entry = McpServerEntry {
            url: Some("https://example.com/mcp/SSE".into()),
            ..Default::default()
        };
        assert_eq!(infer_transport(&entry).unwrap(), TransportKind::StreamableHttp);
    }

    #[test]
    fn infers_streamable_http_otherwise() {
        let entry = McpServerEntry {
            url: Some("https://example.com/mcp".into()),
            ..Default::default()
        };
        assert_eq!(infer_transport(&entry).unwrap(), TransportKind::StreamableHttp);
    }

    #[test]
    fn env_accepts_list_form() {
        let json = serde_json::json!({ "command": "node", "env": ["FOO=bar", "BAZ=qux"] });
        let entry: McpServerEntry = serde_json::from_value(json).unwrap();
        assert_eq!(entry.env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(entry.env.get("BAZ").map(String::as_str), Some("qux"));
    }

    #[test]
    fn mcp_endpoint_accepts_single_string_or_array() {
        let one: XiaozhiConfig = serde_json::from_value(serde_json::json!({ "mcpEndpoint": "ws://e" })).unwrap();
        assert_eq!(one.mcp_endpoint, vec!["ws://e".to_string()]);

        let many: XiaozhiConfig = serde_json::from_value(serde_json::json!({ "mcpEndpoint": ["ws://a", "ws://b"] })).unwrap();
        assert_eq!(many.mcp_endpoint, vec!["ws://a".to_string(), "ws://b".to_string()]);

        let none: XiaozhiConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(none.mcp_endpoint.is_empty());
    }
}
