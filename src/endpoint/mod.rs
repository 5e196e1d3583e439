//! Downstream WebSocket endpoint manager: one reconnecting session per
//! configured endpoint URL. Each session pumps inbound JSON-RPC frames to a
//! shared [`FrameHandler`], serializes its own outbound writes, and is
//! otherwise independent of every other session — one endpoint dropping
//! never touches another.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

const RECONNECT_INITIAL: Duration = Duration::from_secs(2);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(35);
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Dispatches one inbound raw JSON-RPC frame, producing the serialized
/// response frame to send back if the message was a request (`None` for
/// notifications). The handler owns parsing and size validation (§4.5) —
/// this manager only pumps bytes.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, raw: &str) -> Option<String>;
}

/// Owns the set of downstream sessions. `urls` of length 0 opens no
/// session, per the normalized `mcpEndpoint` configuration rule.
pub struct EndpointManager<H: FrameHandler + 'static> {
    handler: Arc<H>,
    sessions: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: FrameHandler + 'static> EndpointManager<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self, urls: Vec<String>) {
        let mut sessions = self.sessions.lock().await;
        for url in urls {
            let handler = Arc::clone(&self.handler);
            sessions.push(tokio::spawn(run_session(url, handler)));
        }
    }

    /// Cancel every session's task immediately. Graceful per-session
    /// close (close frame + grace wait) happens inside `pump_session` when
    /// the remote end closes first; a forced `stop_all` does not wait.
    pub async fn stop_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for session in sessions.drain(..) {
            session.abort();
        }
    }
}

/// Next reconnect delay given the previous one, doubling and capped.
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_MAX)
}

async fn run_session<H: FrameHandler + 'static>(url: String, handler: Arc<H>) {
    let mut backoff = RECONNECT_INITIAL;

    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _response)) => {
                tracing::debug!(endpoint = %url, "downstream endpoint connected");
                backoff = RECONNECT_INITIAL;
                pump_session(stream, &handler).await;
                tracing::warn!(endpoint = %url, "downstream endpoint session ended; reconnecting");
            }
            Err(err) => {
                tracing::warn!(endpoint = %url, error = %err, "failed to connect downstream endpoint");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

async fn pump_session<H: FrameHandler + 'static>(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, handler: &Arc<H>) {
    let (write, mut read) = stream.split();
    let write = Arc::new(Mutex::new(write));
    let mut last_activity = Instant::now();

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(message)) => {
                        last_activity = Instant::now();
                        if dispatch(message, handler, &write).await.is_break() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > HEARTBEAT_TIMEOUT {
                    tracing::warn!("downstream endpoint inactive past heartbeat timeout; closing");
                    break;
                }
                let mut writer = write.lock().await;
                if writer.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let mut writer = write.lock().await;
    let _ = tokio::time::timeout(CLOSE_GRACE, writer.send(Message::Close(None))).await;
}

/// Handle one inbound frame. Returns [`std::ops::ControlFlow::Break`] when
/// the session should end (remote close or an unrecoverable send failure).
async fn dispatch<H: FrameHandler + 'static>(
    message: Message,
    handler: &Arc<H>,
    write: &Arc<Mutex<futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>,
) -> std::ops::ControlFlow<()> {
    match message {
        Message::Text(text) => {
            let handler = Arc::clone(handler);
            let write = Arc::clone(write);
            tokio::spawn(async move {
                if let Some(response) = handler.handle(&text).await {
                    let mut writer = write.lock().await;
                    let _ = writer.send(Message::Text(response)).await;
                }
            });
            std::ops::ControlFlow::Continue(())
        }
        Message::Ping(payload) => {
            let mut writer = write.lock().await;
            let _ = writer.send(Message::Pong(payload)).await;
            std::ops::ControlFlow::Continue(())
        }
        Message::Close(_) => std::ops::ControlFlow::Break(()),
        _ => std::ops::ControlFlow::Continue(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_thirty_seconds() {
        let mut delay = RECONNECT_INITIAL;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(delay);
            delay = next_backoff(delay);
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(30),
                Duration::from_secs(30),
            ]
        );
    }
}
