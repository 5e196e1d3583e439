//! MCP message handler: the JSON-RPC 2.0 state machine a downstream
//! [`FrameHandler`](crate::endpoint::FrameHandler) delegates to. Owns
//! request validation, method routing, and the `tools/call` dispatch that
//! forwards to an upstream service or the custom-tool handler.

use crate::custom::{CUSTOM_SERVICE_NAME, CustomToolHandler};
use crate::endpoint::FrameHandler;
use crate::registry::{ListFilter, SharedToolRegistry, SortBy};
use crate::supervisor::ServiceSupervisor;
use crate::types::ProxyError;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_MESSAGE_BYTES: usize = 1024 * 1024;
const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2024-11-05"];
const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
const GLOBAL_CALL_DEADLINE: Duration = Duration::from_secs(8);

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;

pub const SERVER_NAME: &str = "xiaozhi-mcp-server";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Negotiate the protocol version to reply with: the highest one in common
/// with the requester's advertised version, falling back to the default if
/// the requester's version is unrecognized.
fn negotiate_protocol_version(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|v| SUPPORTED_PROTOCOL_VERSIONS.iter().find(|&&supported| supported == v))
        .copied()
        .unwrap_or(DEFAULT_PROTOCOL_VERSION)
}

/// Owns everything one downstream session's message handling needs:
/// shared handles into the registry, the supervisor, and the custom-tool
/// handler. Stateless across calls beyond those shared handles — a single
/// instance can be shared by every downstream session.
pub struct McpMessageHandler {
    registry: SharedToolRegistry,
    supervisor: Arc<ServiceSupervisor>,
    custom: Arc<CustomToolHandler>,
}

impl McpMessageHandler {
    pub fn new(registry: SharedToolRegistry, supervisor: Arc<ServiceSupervisor>, custom: Arc<CustomToolHandler>) -> Self {
        Self { registry, supervisor, custom }
    }

    /// Handle one raw inbound frame, producing the response frame to send
    /// back (`None` for notifications). Owns the size/parse/shape
    /// validation the transport layer no longer does.
    pub async fn handle_raw(&self, raw: &str) -> Option<String> {
        if raw.len() > MAX_MESSAGE_BYTES {
            return Some(error_response(Value::Null, INVALID_REQUEST, "message exceeds maximum size", None).to_string());
        }

        let parsed: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => return Some(error_response(Value::Null, PARSE_ERROR, "failed to parse JSON", None).to_string()),
        };

        let Some(object) = parsed.as_object() else {
            return Some(error_response(Value::Null, INVALID_REQUEST, "request must be a JSON object", None).to_string());
        };

        if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Some(error_response(Value::Null, INVALID_REQUEST, "missing or invalid `jsonrpc` field", None).to_string());
        }

        let Some(method) = object.get("method").and_then(Value::as_str) else {
            return Some(error_response(Value::Null, INVALID_REQUEST, "missing string `method` field", None).to_string());
        };

        let id = object.get("id").cloned();
        let params = object.get("params").cloned().unwrap_or(Value::Null);
        let is_notification = id.is_none();

        let response = self.dispatch(method, params, id.clone()).await;

        if is_notification { None } else { Some(response.to_string()) }
    }

    async fn dispatch(&self, method: &str, params: Value, id: Option<Value>) -> Value {
        let id = id.unwrap_or(Value::Null);

        match method {
            "initialize" => {
                let requested = params.get("protocolVersion").and_then(Value::as_str);
                let version = negotiate_protocol_version(requested);
                success_response(
                    id,
                    json!({
                        "protocolVersion": version,
                        "serverInfo": { "name": SERVER_NAME, "version": SERVER_VERSION },
                        "capabilities": { "tools": {} },
                    }),
                )
            }
            "notifications/initialized" => Value::Null,
            "tools/list" => {
                let tools = self.registry.list(ListFilter::Enabled, SortBy::Name).await;
                success_response(id, json!({ "tools": tools }))
            }
            "tools/call" => self.dispatch_tool_call(id, params).await,
            "resources/list" => success_response(id, json!({ "resources": [] })),
            "prompts/list" => success_response(id, json!({ "prompts": [] })),
            "ping" => success_response(id, json!({})),
            other => error_response(id, METHOD_NOT_FOUND, format!("unknown method: {other}"), None),
        }
    }

    async fn dispatch_tool_call(&self, id: Value, params: Value) -> Value {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return error_response(id, INVALID_REQUEST, "missing `name` in tools/call params", None);
        };
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        let Some(tool) = self.registry.resolve(name).await else {
            return error_response(id, METHOD_NOT_FOUND, "tool not found", Some(json!({ "code": "TOOL_NOT_FOUND" })));
        };
        if !tool.enabled {
            return error_response(id, METHOD_NOT_FOUND, "tool not found", Some(json!({ "code": "TOOL_NOT_FOUND" })));
        }

        let started = Instant::now();
        let registry = Arc::clone(&self.registry);
        let name_owned = name.to_string();
        let args_for_record = arguments.clone();
        let cache_key = CustomToolHandler::cache_key(&name_owned, &arguments);

        // A retry of a call that previously outran the deadline below: the
        // background task it spawned may have finished and cached its
        // result since, in which case this request is satisfied without
        // re-executing anything.
        if let Some(cached) = self.custom.take_cached(&cache_key).await {
            let duration_ms = started.elapsed().as_millis() as u64;
            registry.record_call(&name_owned, args_for_record, true, duration_ms, None, summarize(&cached)).await;
            return success_response(id, cached);
        }

        let custom = Arc::clone(&self.custom);
        let supervisor = Arc::clone(&self.supervisor);
        let service_name = tool.service_name.clone();
        let original_name = tool.original_name.clone();
        let exec_args = arguments.clone();
        let store_key = cache_key.clone();

        // Run the actual call on a background task decoupled from the
        // client-facing deadline below, so a call that outruns it still
        // runs to completion and lands in the cache for a retry to pick up
        // (§4.5 step 6) instead of being dropped when the timeout future is
        // cancelled.
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let result = if service_name == CUSTOM_SERVICE_NAME {
                custom.execute(&original_name, exec_args).await
            } else {
                supervisor.call_tool(&service_name, &original_name, exec_args, GLOBAL_CALL_DEADLINE).await
            };
            if let Ok(value) = &result {
                custom.store_completed(store_key, value.clone()).await;
            }
            let _ = done_tx.send(result);
        });

        match tokio::time::timeout(GLOBAL_CALL_DEADLINE, done_rx).await {
            Ok(Ok(Ok(result))) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                registry.record_call(&name_owned, args_for_record, true, duration_ms, None, summarize(&result)).await;
                success_response(id, result)
            }
            Ok(Ok(Err(err))) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                registry.record_call(&name_owned, args_for_record, false, duration_ms, Some(err.to_string()), None).await;
                error_response(id, err.json_rpc_code(), err.to_string(), Some(json!({ "code": err.data_code() })))
            }
            Ok(Err(_)) => {
                // The spawned task's sender was dropped without a result —
                // it panicked. Record and surface as an internal error.
                let duration_ms = started.elapsed().as_millis() as u64;
                registry
                    .record_call(&name_owned, args_for_record, false, duration_ms, Some("tool execution task aborted".into()), None)
                    .await;
                error_response(id, ProxyError::internal("tool execution task aborted").json_rpc_code(), "internal error", None)
            }
            Err(_) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                registry
                    .record_call(&name_owned, args_for_record, false, duration_ms, Some("deadline exceeded".into()), None)
                    .await;
                success_response(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": format!("task in progress: {cache_key}") }],
                        "isError": false,
                        "taskId": cache_key,
                    }),
                )
            }
        }
    }
}

#[async_trait]
impl FrameHandler for McpMessageHandler {
    async fn handle(&self, raw: &str) -> Option<String> {
        self.handle_raw(raw).await
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message.into() });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

fn summarize(result: &Value) -> Option<String> {
    result.get("content")?.get(0)?.get("text")?.as_str().map(|s| s.chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolSettings;
    use crate::events::EventBus;
    use crate::registry::{ToolRegistry, spawn_tool_call_logger};
    use crate::types::Tool;
    use std::collections::BTreeMap;

    async fn handler_with_tool() -> (McpMessageHandler, SharedToolRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let (logger, _task) = spawn_tool_call_logger(dir.path().join("calls.ndjson"));
        let registry: SharedToolRegistry = Arc::new(ToolRegistry::new(EventBus::new(), dir.path().join("cache.json"), logger));
        registry
            .register_service("calc", vec![Tool::new("calc", "add", "adds".into(), json!({}))], None)
            .await;

        let supervisor = Arc::new(ServiceSupervisor::new(Arc::clone(&registry), EventBus::new()));
        let custom = Arc::new(CustomToolHandler::new(Vec::new(), None));
        (McpMessageHandler::new(Arc::clone(&registry), supervisor, custom), registry)
    }

    #[tokio::test]
    async fn initialize_negotiates_known_version() {
        let (handler, _registry) = handler_with_tool().await;
        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": { "protocolVersion": "2024-11-05" } }).to_string();
        let response: Value = serde_json::from_str(&handler.handle_raw(&raw).await.unwrap()).unwrap();
        assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(response["result"]["serverInfo"]["name"], SERVER_NAME);
    }

    #[tokio::test]
    async fn initialize_falls_back_on_unknown_version() {
        let (handler, _registry) = handler_with_tool().await;
        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": { "protocolVersion": "1999-01-01" } }).to_string();
        let response: Value = serde_json::from_str(&handler.handle_raw(&raw).await.unwrap()).unwrap();
        assert_eq!(response["result"]["protocolVersion"], DEFAULT_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn notification_produces_no_response() {
        let (handler, _registry) = handler_with_tool().await;
        let raw = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }).to_string();
        assert!(handler.handle_raw(&raw).await.is_none());
    }

    #[tokio::test]
    async fn tools_list_returns_enabled_tools_sorted() {
        let (handler, _registry) = handler_with_tool().await;
        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }).to_string();
        let response: Value = serde_json::from_str(&handler.handle_raw(&raw).await.unwrap()).unwrap();
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "calc__add");
    }

    #[tokio::test]
    async fn unknown_tool_call_is_method_not_found() {
        let (handler, _registry) = handler_with_tool().await;
        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": { "name": "nope", "arguments": {} } }).to_string();
        let response: Value = serde_json::from_str(&handler.handle_raw(&raw).await.unwrap()).unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn disabled_tool_call_is_method_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, _task) = spawn_tool_call_logger(dir.path().join("calls.ndjson"));
        let registry: SharedToolRegistry = Arc::new(ToolRegistry::new(EventBus::new(), dir.path().join("cache.json"), logger));
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
        registry
            .register_service("calc", vec![Tool::new("calc", "add", "adds".into(), json!({}))], Some(&settings))
            .await;

        let supervisor = Arc::new(ServiceSupervisor::new(Arc::clone(&registry), EventBus::new()));
        let custom = Arc::new(CustomToolHandler::new(Vec::new(), None));
        let handler = McpMessageHandler::new(Arc::clone(&registry), supervisor, custom);

        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": { "name": "calc__add", "arguments": {} } }).to_string();
        let response: Value = serde_json::from_str(&handler.handle_raw(&raw).await.unwrap()).unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let (handler, _registry) = handler_with_tool().await;
        let raw = "x".repeat(MAX_MESSAGE_BYTES + 1);
        let response: Value = serde_json::from_str(&handler.handle_raw(&raw).await.unwrap()).unwrap();
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn malformed_json_is_parse_error() {
        let (handler, _registry) = handler_with_tool().await;
        let response: Value = serde_json::from_str(&handler.handle_raw("{ not json").await.unwrap()).unwrap();
        assert_eq!(response["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn resources_and_prompts_list_are_empty() {
        let (handler, _registry) = handler_with_tool().await;
        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "resources/list" }).to_string();
        let response: Value = serde_json::from_str(&handler.handle_raw(&raw).await.unwrap()).unwrap();
        assert_eq!(response["result"]["resources"], json!([]));

        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "prompts/list" }).to_string();
        let response: Value = serde_json::from_str(&handler.handle_raw(&raw).await.unwrap()).unwrap();
        assert_eq!(response["result"]["prompts"], json!([]));
    }

    #[tokio::test]
    async fn ping_replies_with_empty_object() {
        let (handler, _registry) = handler_with_tool().await;
        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }).to_string();
        let response: Value = serde_json::from_str(&handler.handle_raw(&raw).await.unwrap()).unwrap();
        assert_eq!(response["result"], json!({}));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let (handler, _registry) = handler_with_tool().await;
        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "totally/unknown" }).to_string();
        let response: Value = serde_json::from_str(&handler.handle_raw(&raw).await.unwrap()).unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn retry_after_background_completion_returns_cached_result_without_re_executing() {
        use crate::config::{CustomToolDecl, CustomToolHandlerConfig, ScriptHandler, ScriptInterpreter};
        use crate::types::text_result;

        let dir = tempfile::tempdir().unwrap();
        let (logger, _task) = spawn_tool_call_logger(dir.path().join("calls.ndjson"));
        let registry: SharedToolRegistry = Arc::new(ToolRegistry::new(EventBus::new(), dir.path().join("cache.json"), logger));

        // A script that would error if actually executed: the test proves the
        // cache-hit short-circuit in `dispatch_tool_call` serves the earlier
        // background result instead of invoking the handler again, as happens
        // when a retry lands after the first call's deadline already elapsed.
        let custom = Arc::new(CustomToolHandler::new(
            vec![CustomToolDecl {
                name: "greet".into(),
                description: "greets".into(),
                input_schema: json!({ "type": "object" }),
                handler: CustomToolHandlerConfig::Script(ScriptHandler {
                    interpreter: ScriptInterpreter::Bash,
                    content: Some("exit 1".into()),
                    path: None,
                    timeout_ms: 5_000,
                }),
            }],
            None,
        ));
        registry.register_service(CUSTOM_SERVICE_NAME, custom.to_registry_tools(), None).await;

        let arguments = json!({});
        let key = CustomToolHandler::cache_key("greet", &arguments);
        custom.store_completed(key, text_result("already done")).await;

        let supervisor = Arc::new(ServiceSupervisor::new(Arc::clone(&registry), EventBus::new()));
        let handler = McpMessageHandler::new(Arc::clone(&registry), supervisor, custom);

        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": { "name": "greet", "arguments": {} } }).to_string();
        let response: Value = serde_json::from_str(&handler.handle_raw(&raw).await.unwrap()).unwrap();
        assert_eq!(response["result"]["content"][0]["text"], "already done");

        let tool = registry.resolve("greet").await.unwrap();
        assert_eq!(tool.usage_count, 1);
    }

    #[tokio::test]
    async fn custom_tool_call_dispatches_to_handler() {
        use crate::config::{CustomToolDecl, CustomToolHandlerConfig, ScriptHandler, ScriptInterpreter};

        let dir = tempfile::tempdir().unwrap();
        let (logger, _task) = spawn_tool_call_logger(dir.path().join("calls.ndjson"));
        let registry: SharedToolRegistry = Arc::new(ToolRegistry::new(EventBus::new(), dir.path().join("cache.json"), logger));

        let custom = Arc::new(CustomToolHandler::new(
            vec![CustomToolDecl {
                name: "greet".into(),
                description: "greets".into(),
                input_schema: json!({ "type": "object" }),
                handler: CustomToolHandlerConfig::Script(ScriptHandler {
                    interpreter: ScriptInterpreter::Bash,
                    content: Some("echo hi".into()),
                    path: None,
                    timeout_ms: 5_000,
                }),
            }],
            None,
        ));
        registry.register_service(CUSTOM_SERVICE_NAME, custom.to_registry_tools(), None).await;

        let supervisor = Arc::new(ServiceSupervisor::new(Arc::clone(&registry), EventBus::new()));
        let handler = McpMessageHandler::new(Arc::clone(&registry), supervisor, custom);

        let raw = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": { "name": "greet", "arguments": {} } }).to_string();
        let response: Value = serde_json::from_str(&handler.handle_raw(&raw).await.unwrap()).unwrap();
        assert_eq!(response["result"]["content"][0]["text"], "hi");

        let tool = registry.resolve("greet").await.unwrap();
        assert_eq!(tool.usage_count, 1);
    }
}
