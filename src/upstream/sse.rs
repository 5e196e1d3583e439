//! SSE upstream transport: GET a `text/event-stream`, dispatch JSON-RPC
//! responses arriving as `data:` frames to pending callers by id, and POST
//! outgoing requests to a paired endpoint on the same host.

use crate::types::{ProxyError, ServiceConfig};
use crate::upstream::jsonrpc::{IdGenerator, JsonRpcResponse, PROTOCOL_VERSION_FALLBACK, build_request};
use crate::upstream::{HANDSHAKE_TIMEOUT, RawTool, UpstreamConnection};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

const RECONNECT_INITIAL_MS: u64 = 500;
const RECONNECT_MAX_MS: u64 = 10_000;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

pub struct SseConnection {
    client: Client,
    post_url: String,
    headers: reqwest::header::HeaderMap,
    ids: IdGenerator,
    pending: PendingMap,
    last_activity: Arc<AtomicI64>,
    reader_task: JoinHandle<()>,
    epoch: Instant,
}

impl SseConnection {
    pub async fn connect(config: &ServiceConfig) -> Result<Self, ProxyError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| ProxyError::config(format!("service '{}' has no url for sse transport", config.name)))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &config.headers {
            if let (Ok(name), Ok(val)) = (
                reqwest::header::HeaderName::from_bytes(key.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                headers.insert(name, val);
            }
        }

        let client = Client::new();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let epoch = Instant::now();
        let last_activity = Arc::new(AtomicI64::new(0));

        let reader_task = spawn_sse_reader(client.clone(), url.clone(), headers.clone(), Arc::clone(&pending), Arc::clone(&last_activity), epoch);

        let mut conn = Self {
            client,
            post_url: url,
            headers,
            ids: IdGenerator::default(),
            pending,
            last_activity,
            reader_task,
            epoch,
        };

        // Give the stream a brief moment to establish before the first
        // request, mirroring the handshake timeout budget as a whole.
        tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.send_request("initialize", Some(serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION_FALLBACK,
            "capabilities": {},
        })), Duration::from_secs(5)))
            .await
            .map_err(|_| ProxyError::timeout("sse handshake", HANDSHAKE_TIMEOUT.as_millis() as u64))??;

        Ok(conn)
    }

    async fn send_request(&self, method: &str, params: Option<serde_json::Value>, timeout: Duration) -> Result<serde_json::Value, ProxyError> {
        let id = self.ids.next();
        let request = build_request(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let send_result = self
            .client
            .post(&self.post_url)
            .headers(self.headers.clone())
            .json(&request)
            .send()
            .await;

        if let Err(err) = send_result {
            self.pending.lock().await.remove(&id);
            return Err(ProxyError::transport("sse", err.to_string()));
        }

        let response = tokio::time::timeout(timeout, rx).await.map_err(|_| {
            ProxyError::timeout(method.to_string(), timeout.as_millis() as u64)
        });

        // Whether we timed out or the sender half was dropped, make sure the
        // pending entry cannot linger.
        self.pending.lock().await.remove(&id);

        let response = response?.map_err(|_| ProxyError::transport("sse", "response channel closed"))?;

        if let Some(error) = response.error {
            return Err(ProxyError::transport("sse", error.message));
        }

        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }
}

fn spawn_sse_reader(client: Client, url: String, headers: reqwest::header::HeaderMap, pending: PendingMap, last_activity: Arc<AtomicI64>, epoch: Instant) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff_ms = RECONNECT_INITIAL_MS;
        let mut last_event_id: Option<String> = None;

        loop {
            let mut request = client.get(&url).headers(headers.clone()).header("Accept", "text/event-stream");
            if let Some(id) = &last_event_id {
                request = request.header("Last-Event-ID", id.clone());
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(RECONNECT_MAX_MS);
                    continue;
                }
            };

            backoff_ms = RECONNECT_INITIAL_MS;
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(boundary) = find_frame_boundary(&buffer) {
                    let frame: String = buffer.drain(..boundary).collect();
                    // Drop the boundary itself (either "\n\n" or "\r\n\r\n").
                    let trim_len = if buffer.starts_with("\r\n") { 2 } else { 1 };
                    buffer.drain(..trim_len.min(buffer.len()));

                    if let Some((data, event_id)) = parse_frame(&frame) {
                        last_activity.store(epoch.elapsed().as_millis() as i64, Ordering::Relaxed);
                        if let Some(id) = event_id {
                            last_event_id = Some(id);
                        }
                        if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&data) {
                            if let Some(id) = response.id {
                                if let Some(sender) = pending.lock().await.remove(&id) {
                                    let _ = sender.send(response);
                                }
                            }
                        }
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(RECONNECT_MAX_MS);
        }
    })
}

fn find_frame_boundary(buffer: &str) -> Option<usize> {
    buffer.find("\n\n").or_else(|| buffer.find("\r\n\r\n"))
}

/// Parse a single SSE frame's `data:`/`id:` lines (ignoring `event:`/`retry:`,
/// which this transport does not need beyond resumption bookkeeping).
fn parse_frame(frame: &str) -> Option<(String, Option<String>)> {
    let mut data_lines = Vec::new();
    let mut id = None;

    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("id:") {
            id = Some(rest.trim().to_string());
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some((data_lines.join("\n"), id))
}

#[async_trait]
impl UpstreamConnection for SseConnection {
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

    async fn close(&mut self) {
        self.reader_task.abort();
    }

    fn last_activity(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_activity.load(Ordering::Relaxed).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_and_id_fields() {
        let frame = "event: message\nid: 42\ndata: {\"jsonrpc\":\"2.0\"}";
        let (data, id) = parse_frame(frame).unwrap();
        assert_eq!(data, "{\"jsonrpc\":\"2.0\"}");
        assert_eq!(id.as_deref(), Some("42"));
    }

    #[test]
    fn ignores_frames_without_data() {
        assert!(parse_frame("event: ping\n").is_none());
    }

    #[test]
    fn finds_lf_and_crlf_boundaries() {
        assert_eq!(find_frame_boundary("a\n\nb"), Some(1));
        assert_eq!(find_frame_boundary("a\r\n\r\nb"), Some(1));
        assert_eq!(find_frame_boundary("no boundary"), None);
    }
}
