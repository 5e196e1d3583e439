//! Custom-tool handler: executes tools declared in configuration as either
//! an HTTP workflow call (`proxy:coze`) or a local script, with an
//! at-most-once result cache keyed by `(toolName, canonicalized arguments)`
//! so a retry after a timeout response replays the completed result
//! instead of re-executing.

use crate::config::{CustomToolDecl, CustomToolHandlerConfig, ProxyHandler, ScriptHandler};
use crate::types::{CustomToolResult, CustomToolStatus, ProxyError, Tool, error_result, text_result};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;

const RESULT_TTL_MS: u64 = 300_000;

/// Sentinel "service name" under which custom tools are registered in the
/// tool registry, distinguishing them from upstream-owned tools when the
/// message handler decides where to route a `tools/call`.
pub const CUSTOM_SERVICE_NAME: &str = "custom";

/// Owns the set of configured custom-tool declarations plus the one-shot
/// result cache they share.
pub struct CustomToolHandler {
    client: reqwest::Client,
    coze_token: Option<String>,
    declarations: HashMap<String, CustomToolDecl>,
    cache: Mutex<HashMap<String, CustomToolResult>>,
}

impl CustomToolHandler {
    pub fn new(declarations: Vec<CustomToolDecl>, coze_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            coze_token,
            declarations: declarations.into_iter().map(|d| (d.name.clone(), d)).collect(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_custom_tool(&self, name: &str) -> bool {
        self.declarations.contains_key(name)
    }

    /// Tool entries for the registry, namespaced identically to their
    /// declared name (custom tools do not carry a `<service>__` prefix —
    /// there is no owning upstream to namespace under).
    pub fn to_registry_tools(&self) -> Vec<Tool> {
        self.declarations
            .values()
            .map(|decl| Tool {
                name: decl.name.clone(),
                description: decl.description.clone(),
                input_schema: decl.input_schema.clone(),
                service_name: CUSTOM_SERVICE_NAME.to_string(),
                original_name: decl.name.clone(),
                enabled: true,
                usage_count: 0,
                last_used_at: None,
            })
            .collect()
    }

    /// Deterministic cache key for `(toolName, arguments)`. `serde_json`'s
    /// default `Map` is key-sorted (the `preserve_order` feature is not
    /// enabled), so `to_string` already yields a canonical encoding.
    pub fn cache_key(tool_name: &str, arguments: &Value) -> String {
        let canonical = serde_json::to_string(arguments).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(tool_name.as_bytes());
        hasher.update(b"\0");
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Consult the one-shot cache for `key`. A hit marks the entry consumed
    /// so a second read misses even within the TTL window.
    pub async fn take_cached(&self, key: &str) -> Option<Value> {
        let mut cache = self.cache.lock().await;
        let entry = cache.get_mut(key)?;
        if entry.consumed || entry.status != CustomToolStatus::Completed || entry.is_expired() {
            return None;
        }
        entry.consumed = true;
        Some(entry.result.clone())
    }

    /// Store a completed result under `key`, making it available to a
    /// subsequent `take_cached`. Exposed beyond this module so the message
    /// handler can populate the cache for non-custom (upstream) tool calls
    /// that outrun the global call deadline, not only for this handler's
    /// own executions.
    pub async fn store_completed(&self, key: String, result: Value) {
        let mut cache = self.cache.lock().await;
        cache.insert(
            key,
            CustomToolResult {
                result,
                status: CustomToolStatus::Completed,
                timestamp: chrono::Utc::now(),
                ttl_ms: RESULT_TTL_MS,
                consumed: false,
                retry_count: 0,
            },
        );
    }

    /// Execute `name` with `arguments`, consulting the one-shot cache
    /// first. Execution errors are folded into an `isError:true` result
    /// rather than propagated, per the handler's error policy; only an
    /// unknown tool name is a hard `Err`.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<Value, ProxyError> {
        let key = Self::cache_key(name, &arguments);
        if let Some(cached) = self.take_cached(&key).await {
            return Ok(cached);
        }

        let decl = self.declarations.get(name).ok_or_else(|| ProxyError::tool_not_found(name))?.clone();

        let outcome = match &decl.handler {
            CustomToolHandlerConfig::Proxy(ProxyHandler::Coze { base_url, workflow_id }) => self.run_coze(base_url, workflow_id, &arguments).await,
            CustomToolHandlerConfig::Script(script) => self.run_script(script, &arguments).await,
        };

        match outcome {
            Ok(value) => {
                self.store_completed(key, value.clone()).await;
                Ok(value)
            }
            // No cache entry is stored for a failure: the next call retries
            // from scratch, matching the timeout recovery contract.
            Err(err) => {
                tracing::warn!(tool = name, error = %crate::logging::redact(&err.to_string()), "custom tool execution failed");
                Ok(error_result(err.to_string()))
            }
        }
    }

    async fn run_coze(&self, base_url: &str, workflow_id: &str, arguments: &Value) -> Result<Value, ProxyError> {
        let url = format!("{}/v1/workflow/run", base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&json!({
            "workflow_id": workflow_id,
            "parameters": arguments,
        }));
        if let Some(token) = &self.coze_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| ProxyError::transport("proxy:coze", e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProxyError::transport("proxy:coze", format!("status {}", response.status())));
        }

        let body: Value = response.json().await.map_err(|e| ProxyError::transport("proxy:coze", e.to_string()))?;
        let text = body
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProxyError::transport("proxy:coze", "response missing string `data` field"))?;

        Ok(text_result(text))
    }

    async fn run_script(&self, script: &ScriptHandler, arguments: &Value) -> Result<Value, ProxyError> {
        let temp_dir = tempfile::tempdir().map_err(|e| ProxyError::internal(e.to_string()))?;

        let script_path = match (&script.content, &script.path) {
            (Some(content), _) => {
                let path = temp_dir.path().join(format!("tool.{}", script.interpreter.extension()));
                tokio::fs::write(&path, content).await.map_err(|e| ProxyError::internal(e.to_string()))?;
                path
            }
            (None, Some(path)) => std::path::PathBuf::from(path),
            (None, None) => return Err(ProxyError::config("script handler has neither inline content nor a path")),
        };

        let args_json = serde_json::to_string(arguments).unwrap_or_else(|_| "{}".to_string());

        let mut command = Command::new(script.interpreter.program());
        command
            .arg(&script_path)
            .env("XIAOZHI_ARGUMENTS", &args_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| ProxyError::transport("script", e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(args_json.as_bytes()).await;
        }
        let mut stdout_pipe = child.stdout.take().expect("stdout configured as piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr configured as piped");

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let timeout = Duration::from_millis(script.timeout_ms.max(1));

        let run = async {
            tokio::try_join!(stdout_pipe.read_to_end(&mut stdout_buf), stderr_pipe.read_to_end(&mut stderr_buf), child.wait(),)
        };

        let status = match tokio::time::timeout(timeout, run).await {
            Ok(Ok((_, _, status))) => status,
            Ok(Err(e)) => return Err(ProxyError::transport("script", e.to_string())),
            Err(_) => {
                let _ = child.start_kill();
                let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
                // temp_dir is still dropped below on this path, cleaning up
                // the materialized script regardless of how execution ended.
                return Err(ProxyError::timeout(format!("script {}", script.interpreter.program()), script.timeout_ms));
            }
        };

        if !status.success() {
            return Err(ProxyError::transport("script", String::from_utf8_lossy(&stderr_buf).trim().to_string()));
        }

        Ok(text_result(String::from_utf8_lossy(&stdout_buf).trim()))
    }
}
