//! Streamable-HTTP upstream transport: one POST per JSON-RPC request,
//! response read as a single JSON body. Unlike the SSE transport there is
//! no persistent reader task — correlation by id is trivial because each
//! request already owns its own response.

use crate::types::{ProxyError, ServiceConfig};
use crate::upstream::jsonrpc::{IdGenerator, JsonRpcResponse, PROTOCOL_VERSION_FALLBACK, build_request};
use crate::upstream::{HANDSHAKE_TIMEOUT, RawTool, UpstreamConnection};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

pub struct HttpConnection {
    client: Client,
    url: String,
    headers: reqwest::header::HeaderMap,
    ids: IdGenerator,
    last_activity: StdMutex<Instant>,
}

impl HttpConnection {
    pub async fn connect(config: &ServiceConfig) -> Result<Self, ProxyError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| ProxyError::config(format!("service '{}' has no url for streamable-http transport", config.name)))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &config.headers {
            if let (Ok(name), Ok(val)) = (
                reqwest::header::HeaderName::from_bytes(key.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }

        let conn = Self {
            client: Client::new(),
            url,
            headers,
            ids: IdGenerator::default(),
            last_activity: StdMutex::new(Instant::now()),
        };

        tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            conn.send_request(
                "initialize",
                Some(serde_json::json!({ "protocolVersion": PROTOCOL_VERSION_FALLBACK, "capabilities": {} })),
                Duration::from_secs(10),
            ),
        )
        .await
        .map_err(|_| ProxyError::timeout("streamable-http handshake", HANDSHAKE_TIMEOUT.as_millis() as u64))??;

        Ok(conn)
    }

    async fn send_request(&self, method: &str, params: Option<serde_json::Value>, timeout: Duration) -> Result<serde_json::Value, ProxyError> {
        let id = self.ids.next();
        let request = build_request(id, method, params);

        let response = tokio::time::timeout(
            timeout,
            self.client.post(&self.url).headers(self.headers.clone()).json(&request).send(),
        )
        .await
        .map_err(|_| ProxyError::timeout(method.to_string(), timeout.as_millis() as u64))?
        .map_err(|e| ProxyError::transport("streamable-http", e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProxyError::transport("streamable-http", format!("status {}", response.status())));
        }

        let body: JsonRpcResponse = response.json().await.map_err(|e| ProxyError::transport("streamable-http", e.to_string()))?;

        *self.last_activity.lock().unwrap() = Instant::now();

        if let Some(error) = body.error {
            return Err(ProxyError::transport("streamable-http", error.message));
        }

        Ok(body.result.unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl UpstreamConnection for HttpConnection {
    async fn handshake(&mut self) -> Result<Vec<RawTool>, ProxyError> {
        let result = self.send_request("tools/list", None, Duration::from_secs(10)).await?;
        let tools = result.get("tools").cloned().unwrap_or(serde_json::Value::Array(vec![]));
        let tools: Vec<serde_json::Value> = serde_json::from_value(tools).unwrap_or_default();

        Ok(tools
            .into_iter()
            .map(|t| RawTool {
                name: t.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                description: t.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                input_schema: t.get("inputSchema").cloned().unwrap_or(serde_json::json!({})),
            })
            .collect())
    }

    async fn call_tool(&mut self, original_name: &str, arguments: serde_json::Value, timeout: Duration) -> Result<serde_json::Value, ProxyError> {
        self.send_request("tools/call", Some(serde_json::json!({ "name": original_name, "arguments": arguments })), timeout)
            .await
    }

    async fn ping(&mut self) -> Result<(), ProxyError> {
        self.send_request("ping", None, Duration::from_secs(5)).await.map(|_| ())
    }

    async fn close(&mut self) {}

    fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }
}
