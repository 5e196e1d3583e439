//! Upstream MCP service clients: one implementation per transport, behind
//! a shared [`UpstreamConnection`] trait so the supervisor does not need to
//! know which transport a given service uses.

pub mod http;
mod jsonrpc;
pub mod sse;
pub mod stdio;

use crate::types::{ProxyError, ServiceConfig, TransportKind};
use async_trait::async_trait;
use std::time::{Duration, Instant};

/// A tool as reported by an upstream's `tools/list`, before the registry
/// namespaces it under `<serviceName>__<originalName>`.
#[derive(Debug, Clone)]
pub struct RawTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// The default per-call timeout for `tools/call`, per the component design.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(8);
/// Handshake timeout: `initialize` + `tools/list` together must complete
/// within this window or the connection attempt fails.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Health-check ping cadence.
pub const HEALTH_PING_INTERVAL: Duration = Duration::from_secs(10);
/// Inactivity cutoff after which a connected client is force-reconnected.
pub const HEALTH_INACTIVITY_CUTOFF: Duration = Duration::from_secs(35);

/// An established (or establishing) connection to one upstream service.
#[async_trait]
pub trait UpstreamConnection: Send {
    /// Perform `initialize` then `tools/list`, returning the raw tool list.
    async fn handshake(&mut self) -> Result<Vec<RawTool>, ProxyError>;

    /// Forward a `tools/call` using the tool's bare (non-namespaced) name.
    async fn call_tool(&mut self, original_name: &str, arguments: serde_json::Value, timeout: Duration) -> Result<serde_json::Value, ProxyError>;

    /// Lightweight liveness probe; also refreshes `last_activity`.
    async fn ping(&mut self) -> Result<(), ProxyError>;

    /// Tear down the transport. Idempotent.
    async fn close(&mut self);

    /// Timestamp of the last byte received from the upstream (handshake,
    /// call response, or ping reply), used by the health monitor.
    fn last_activity(&self) -> Instant;
}

/// Instantiate the right transport for a service config, per the fixed
/// inference rule already applied when [`ServiceConfig`] was built.
pub async fn connect(config: &ServiceConfig) -> Result<Box<dyn UpstreamConnection>, ProxyError> {
    match config.kind {
        TransportKind::Stdio => stdio::StdioConnection::connect(config).await.map(|c| Box::new(c) as Box<dyn UpstreamConnection>),
        TransportKind::Sse => sse::SseConnection::connect(config).await.map(|c| Box::new(c) as Box<dyn UpstreamConnection>),
        TransportKind::StreamableHttp => http::HttpConnection::connect(config)
            .await
            .map(|c| Box::new(c) as Box<dyn UpstreamConnection>),
    }
}
