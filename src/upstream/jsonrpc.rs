//! Minimal JSON-RPC 2.0 request/response shapes shared by the hand-rolled
//! SSE and streamable-http upstream transports (the stdio transport
//! delegates wire-level JSON-RPC to `rmcp` directly).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION_LATEST: &str = "2025-06-18";
pub const PROTOCOL_VERSION_FALLBACK: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Monotonic request-id generator, one per upstream connection.
#[derive(Default)]
pub struct IdGenerator(AtomicU64);

impl IdGenerator {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub fn build_request(id: u64, method: impl Into<String>, params: Option<Value>) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: JSONRPC_VERSION,
        id,
        method: method.into(),
        params,
    }
}
