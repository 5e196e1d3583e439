//! Service supervisor: one long-lived task per configured upstream, driving
//! handshake, health monitoring, and retry/backoff, and feeding successful
//! handshakes into the tool registry.

pub mod retry;

use crate::config::ToolSettings;
use crate::events::{EventBus, names};
use crate::registry::{ListFilter, SharedToolRegistry, SortBy};
use crate::types::{ConnectionStatus, ProxyError, ServiceConfig, ServiceState, Tool};
use crate::upstream::{self, HEALTH_INACTIVITY_CUTOFF, HEALTH_PING_INTERVAL};
use retry::RetryState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Aggregate status returned by `getStatus()`: per-service connection state
/// plus tool-availability counters derived from the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub services: BTreeMap<String, ConnectionStatus>,
    pub total_tools: usize,
    pub available_tools: usize,
}

/// A `tools/call` forwarded to the task that owns the upstream connection.
pub struct CallRequest {
    pub original_name: String,
    pub arguments: serde_json::Value,
    pub timeout: Duration,
    pub reply: oneshot::Sender<Result<serde_json::Value, ProxyError>>,
}

enum Control {
    Stop,
}

struct RunningHandle {
    call_tx: mpsc::Sender<CallRequest>,
    control_tx: mpsc::Sender<Control>,
    status: Arc<Mutex<ConnectionStatus>>,
    task: JoinHandle<()>,
}

struct ServiceEntry {
    config: ServiceConfig,
    tool_settings: Option<BTreeMap<String, ToolSettings>>,
    running: Option<RunningHandle>,
}

/// Owns the map of configured upstream services and their running tasks.
pub struct ServiceSupervisor {
    registry: SharedToolRegistry,
    events: EventBus,
    services: Mutex<BTreeMap<String, ServiceEntry>>,
}

impl ServiceSupervisor {
    pub fn new(registry: SharedToolRegistry, events: EventBus) -> Self {
        Self {
            registry,
            events,
            services: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a service config and start it immediately. Idempotent on
    /// `name`: re-adding an already-known service is a no-op.
    pub async fn add_service_config(&self, config: ServiceConfig, tool_settings: Option<BTreeMap<String, ToolSettings>>) {
        let mut services = self.services.lock().await;
        if services.contains_key(&config.name) {
            return;
        }
        let running = self.spawn(config.clone(), tool_settings.clone());
        services.insert(
            config.name.clone(),
            ServiceEntry {
                config,
                tool_settings,
                running: Some(running),
            },
        );
    }

    fn spawn(&self, config: ServiceConfig, tool_settings: Option<BTreeMap<String, ToolSettings>>) -> RunningHandle {
        let (call_tx, call_rx) = mpsc::channel(32);
        let (control_tx, control_rx) = mpsc::channel(4);
        let status = Arc::new(Mutex::new(ConnectionStatus::new(config.name.clone())));
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        let status_task = Arc::clone(&status);

        let task = tokio::spawn(run_service(config, registry, events, tool_settings, call_rx, control_rx, status_task));

        RunningHandle {
            call_tx,
            control_tx,
            status,
            task,
        }
    }

    /// Start a previously-added (but currently stopped) service.
    pub async fn start_service(&self, name: &str) -> Result<(), ProxyError> {
        let mut services = self.services.lock().await;
        let entry = services.get_mut(name).ok_or_else(|| ProxyError::service_not_found(name))?;
        if entry.running.is_some() {
            return Err(ProxyError::already_running(name));
        }
        entry.running = Some(self.spawn(entry.config.clone(), entry.tool_settings.clone()));
        Ok(())
    }

    pub async fn stop_service(&self, name: &str) -> Result<(), ProxyError> {
        let mut services = self.services.lock().await;
        let entry = services.get_mut(name).ok_or_else(|| ProxyError::service_not_found(name))?;
        let running = entry.running.take().ok_or_else(|| ProxyError::not_running(name))?;
        let _ = running.control_tx.send(Control::Stop).await;
        running.task.abort();
        self.registry.unregister_service(name).await;
        Ok(())
    }

    pub async fn start_all(&self) {
        let names: Vec<String> = self.services.lock().await.keys().cloned().collect();
        for name in names {
            let _ = self.start_service(&name).await;
        }
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.services.lock().await.keys().cloned().collect();
        for name in names {
            let _ = self.stop_service(&name).await;
        }
    }

    /// `{ services, totalTools, availableTools }` per the component design:
    /// `totalTools` counts every tool currently in the registry regardless
    /// of origin's connection state; `availableTools` counts enabled tools
    /// whose owning service is connected (custom tools, which have no
    /// upstream connection to track, count as always available once
    /// enabled).
    pub async fn get_status(&self) -> SupervisorStatus {
        let services = {
            let services = self.services.lock().await;
            let mut out = BTreeMap::new();
            for (name, entry) in services.iter() {
                let status = match &entry.running {
                    Some(running) => running.status.lock().await.clone(),
                    None => ConnectionStatus::new(name.clone()),
                };
                out.insert(name.clone(), status);
            }
            out
        };

        let tools = self.registry.list(ListFilter::All, SortBy::Name).await;
        let total_tools = tools.len();
        let available_tools = tools
            .iter()
            .filter(|tool| {
                if !tool.enabled {
                    return false;
                }
                if tool.service_name == crate::custom::CUSTOM_SERVICE_NAME {
                    return true;
                }
                services.get(&tool.service_name).map(ConnectionStatus::is_connected).unwrap_or(false)
            })
            .count();

        SupervisorStatus {
            services,
            total_tools,
            available_tools,
        }
    }

    /// Forward a `tools/call` (bare, non-namespaced name) to the task that
    /// owns `service_name`'s connection. Returns `ServiceNotReady` without
    /// attempting delivery if the service is registered but not currently
    /// `connected` — e.g. mid-retry after a transient disconnect — rather
    /// than blocking on the call channel until a reconnect completes.
    pub async fn call_tool(&self, service_name: &str, original_name: &str, arguments: serde_json::Value, timeout: Duration) -> Result<serde_json::Value, ProxyError> {
        let call_tx = {
            let services = self.services.lock().await;
            let entry = services.get(service_name).ok_or_else(|| ProxyError::service_not_found(service_name))?;
            let running = entry.running.as_ref().ok_or_else(|| ProxyError::service_not_ready(service_name))?;
            if !running.status.lock().await.is_connected() {
                return Err(ProxyError::service_not_ready(service_name));
            }
            running.call_tx.clone()
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        call_tx
            .send(CallRequest {
                original_name: original_name.to_string(),
                arguments,
                timeout,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProxyError::service_not_ready(service_name))?;

        reply_rx.await.map_err(|_| ProxyError::service_not_ready(service_name))?
    }
}

async fn run_service(
    config: ServiceConfig,
    registry: SharedToolRegistry,
    events: EventBus,
    tool_settings: Option<BTreeMap<String, ToolSettings>>,
    mut call_rx: mpsc::Receiver<CallRequest>,
    mut control_rx: mpsc::Receiver<Control>,
    status: Arc<Mutex<ConnectionStatus>>,
) {
    let mut retry = RetryState::new(config.reconnect_delay_ms.max(1));

    loop {
        {
            let mut s = status.lock().await;
            s.state = ServiceState::Connecting;
        }

        tracing::debug!(service = %config.name, "connecting to upstream service");
        let mut conn = match upstream::connect(&config).await {
            Ok(conn) => conn,
            Err(err) => {
                note_connect_failure(&config, &events, &status, err).await;
                if retry.wait_and_advance().await.is_err() {
                    return;
                }
                continue;
            }
        };

        let raw_tools = match conn.handshake().await {
            Ok(tools) => tools,
            Err(err) => {
                conn.close().await;
                note_connect_failure(&config, &events, &status, err).await;
                if retry.wait_and_advance().await.is_err() {
                    return;
                }
                continue;
            }
        };

        let tools: Vec<Tool> = raw_tools
            .into_iter()
            .map(|t| Tool::new(&config.name, t.name, t.description, t.input_schema))
            .collect();
        tracing::info!(service = %config.name, tool_count = tools.len(), "upstream service handshake complete");
        registry.register_service(&config.name, tools, tool_settings.as_ref()).await;
        retry.reset();

        {
            let mut s = status.lock().await;
            s.state = ServiceState::Connected;
            s.connected_at = Some(chrono::Utc::now());
            s.last_error = None;
        }
        events.emit(names::SERVICE_CONNECTED, serde_json::json!({ "serviceName": config.name }));

        let mut ping_interval = tokio::time::interval(HEALTH_PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let disconnect_reason = 'session: loop {
            tokio::select! {
                maybe_call = call_rx.recv() => {
                    match maybe_call {
                        Some(call) => {
                            let result = conn.call_tool(&call.original_name, call.arguments, call.timeout).await;
                            let _ = call.reply.send(result);
                        }
                        None => break 'session "call channel closed".to_string(),
                    }
                }
                maybe_control = control_rx.recv() => {
                    match maybe_control {
                        Some(Control::Stop) => {
                            conn.close().await;
                            return;
                        }
                        None => break 'session "control channel closed".to_string(),
                    }
                }
                _ = ping_interval.tick() => {
                    if conn.last_activity().elapsed() > HEALTH_INACTIVITY_CUTOFF {
                        break 'session "inactivity timeout".to_string();
                    }
                    if let Err(err) = conn.ping().await {
                        break 'session err.to_string();
                    }
                }
            }
        };

        conn.close().await;
        // A transient disconnect does NOT evict the service's tools from the
        // registry (§3: tools are evicted when their service is *removed*,
        // not merely disconnected). They stay listed — serving `tools/list`
        // from the last-known catalog — and `call_tool`'s connection-state
        // check above is what makes routing to them fail with
        // `ServiceNotReady` until the reconnect below succeeds.
        // `stop_service` is the only path that actually unregisters.
        tracing::warn!(service = %config.name, reason = %disconnect_reason, "upstream service disconnected");

        {
            let mut s = status.lock().await;
            s.state = ServiceState::Disconnected;
            s.last_error = Some(disconnect_reason.clone());
        }
        events.emit(
            names::SERVICE_DISCONNECTED,
            serde_json::json!({ "serviceName": config.name, "reason": disconnect_reason }),
        );

        if retry.wait_and_advance().await.is_err() {
            return;
        }
    }
}

async fn note_connect_failure(config: &ServiceConfig, events: &EventBus, status: &Arc<Mutex<ConnectionStatus>>, err: ProxyError) {
    let message = err.to_string();
    {
        let mut s = status.lock().await;
        s.state = ServiceState::Error;
        s.last_error = Some(message.clone());
        s.attempts += 1;
    }
    events.emit(
        names::SERVICE_CONNECTION_FAILED,
        serde_json::json!({ "serviceName": config.name, "error": message }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ToolRegistry, spawn_tool_call_logger};
    use crate::types::{Tool, TransportKind};

    async fn supervisor_with_registry() -> (Arc<ServiceSupervisor>, SharedToolRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let (logger, _task) = spawn_tool_call_logger(dir.path().join("calls.ndjson"));
        let registry: SharedToolRegistry = Arc::new(ToolRegistry::new(EventBus::new(), dir.path().join("cache.json"), logger));
        let supervisor = Arc::new(ServiceSupervisor::new(Arc::clone(&registry), EventBus::new()));
        (supervisor, registry)
    }

    fn stub_config(name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            kind: TransportKind::Stdio,
            command: Some("true".into()),
            args: Vec::new(),
            env: BTreeMap::new(),
            url: None,
            headers: BTreeMap::new(),
            timeout_ms: 8_000,
            reconnect_delay_ms: 30_000,
        }
    }

    /// Insert a service entry directly (bypassing `spawn`/`run_service`, which
    /// need a real subprocess) with a given connection state, so routing and
    /// status-aggregation logic can be tested without an actual upstream.
    async fn insert_stub_entry(supervisor: &ServiceSupervisor, name: &str, state: ServiceState) {
        let (call_tx, _call_rx) = mpsc::channel(1);
        let (control_tx, _control_rx) = mpsc::channel(1);
        let mut connection_status = ConnectionStatus::new(name);
        connection_status.state = state;
        let status = Arc::new(Mutex::new(connection_status));

        let mut services = supervisor.services.lock().await;
        services.insert(
            name.to_string(),
            ServiceEntry {
                config: stub_config(name),
                tool_settings: None,
                running: Some(RunningHandle {
                    call_tx,
                    control_tx,
                    status,
                    task: tokio::spawn(async {}),
                }),
            },
        );
    }

    #[tokio::test]
    async fn call_tool_unknown_service_is_not_found() {
        let (supervisor, _registry) = supervisor_with_registry().await;
        let err = supervisor.call_tool("nope", "add", serde_json::json!({}), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProxyError::ServiceNotFound { .. }));
    }

    #[tokio::test]
    async fn call_tool_is_not_ready_while_disconnected() {
        let (supervisor, registry) = supervisor_with_registry().await;
        registry
            .register_service("calc", vec![Tool::new("calc", "add", "adds".into(), serde_json::json!({}))], None)
            .await;
        insert_stub_entry(&supervisor, "calc", ServiceState::Disconnected).await;

        let err = supervisor.call_tool("calc", "add", serde_json::json!({}), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProxyError::ServiceNotReady { .. }));
    }

    #[tokio::test]
    async fn get_status_counts_tools_by_connection_state() {
        let (supervisor, registry) = supervisor_with_registry().await;
        registry
            .register_service("calc", vec![Tool::new("calc", "add", "adds".into(), serde_json::json!({}))], None)
            .await;
        registry
            .register_service("weather", vec![Tool::new("weather", "forecast", "forecasts".into(), serde_json::json!({}))], None)
            .await;
        insert_stub_entry(&supervisor, "calc", ServiceState::Connected).await;
        insert_stub_entry(&supervisor, "weather", ServiceState::Disconnected).await;

        let status = supervisor.get_status().await;
        assert_eq!(status.total_tools, 2);
        assert_eq!(status.available_tools, 1);
        assert!(status.services["calc"].is_connected());
        assert!(!status.services["weather"].is_connected());
    }
}
