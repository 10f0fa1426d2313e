//! Multiplexed CDP WebSocket session
//!
//! One persistent connection carries all commands and events. Each outgoing
//! command gets a locally unique id; the matching response is routed solely
//! by that id to a oneshot waiter. Unsolicited events fan out to bounded
//! per-method subscriber channels so a slow consumer never blocks the read
//! path. There is no automatic reconnection: on connection loss every
//! pending waiter resolves with `ConnectionLost` and the session is dead.

use crate::error::{Result, TransportError};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};

type WsSink = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type PendingMap = HashMap<u64, oneshot::Sender<std::result::Result<Value, TransportError>>>;

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-command response timeout
    pub command_timeout: Duration,
    /// Buffered events per subscriber before overflow drops
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            event_buffer: 64,
        }
    }
}

/// State shared between the session handle and its reader task.
struct Shared {
    pending: Mutex<PendingMap>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Value>>>>,
    /// Ids whose waiters timed out client-side; a reply arriving for one of
    /// these is late, not a protocol violation.
    timed_out: Mutex<HashSet<u64>>,
    alive: AtomicBool,
}

/// Bound on remembered timed-out ids; commands the browser never answers
/// should not grow the set without limit.
const MAX_TIMED_OUT_IDS: usize = 256;

impl Shared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            timed_out: Mutex::new(HashSet::new()),
            alive: AtomicBool::new(true),
        }
    }

    fn note_timeout(&self, id: u64) {
        let mut set = self.timed_out.lock();
        if set.len() >= MAX_TIMED_OUT_IDS {
            set.clear();
        }
        set.insert(id);
    }

    /// Route one incoming frame: a response (by id) or an event (by method).
    ///
    /// An id that matches no outstanding waiter is a protocol violation:
    /// either the browser invented it or it was already answered.
    fn dispatch(&self, message: Value) -> std::result::Result<(), TransportError> {
        if let Some(id) = message.get("id").and_then(Value::as_u64) {
            let waiter = self.pending.lock().remove(&id);
            let Some(waiter) = waiter else {
                if self.timed_out.lock().remove(&id) {
                    debug!("Discarding late response for timed-out command id {}", id);
                    return Ok(());
                }
                return Err(TransportError::MalformedResponse(format!(
                    "response for unknown or duplicate id {id}"
                )));
            };
            let outcome = if let Some(error) = message.get("error") {
                Err(TransportError::Command {
                    method: String::new(),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown CDP error")
                        .to_string(),
                })
            } else {
                Ok(message.get("result").cloned().unwrap_or(Value::Null))
            };
            // Waiter may have timed out and dropped its receiver; not an error.
            let _ = waiter.send(outcome);
            return Ok(());
        }

        if let Some(method) = message.get("method").and_then(Value::as_str) {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let mut subs = self.subscribers.lock();
            if let Some(list) = subs.get_mut(method) {
                list.retain(|tx| match tx.try_send(params.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Dropping '{}' event: subscriber buffer full", method);
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
            return Ok(());
        }

        Err(TransportError::MalformedResponse(
            "frame with neither id nor method".to_string(),
        ))
    }

    /// Mark the session dead and resolve every pending waiter with
    /// `ConnectionLost`.
    fn teardown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let waiters: Vec<_> = self.pending.lock().drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(TransportError::ConnectionLost));
        }
        self.subscribers.lock().clear();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// A live CDP session. Exclusively owned by whichever component drives it.
pub struct CdpSession {
    sink: tokio::sync::Mutex<WsSink>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    config: SessionConfig,
    /// Flatten-mode session id of the attached page target
    target_session: Mutex<Option<String>>,
}

impl CdpSession {
    /// Connect to a debugger WebSocket URL and spawn the read loop.
    #[instrument(skip(config))]
    pub async fn connect(ws_url: &str, config: SessionConfig) -> Result<Self> {
        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let (sink, mut source) = stream.split();
        let shared = Arc::new(Shared::new());

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(message) => {
                            if let Err(e) = reader_shared.dispatch(message) {
                                warn!("Protocol violation: {}", e);
                            }
                        }
                        Err(e) => warn!("Non-JSON frame from browser: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
            info!("CDP read loop ended, tearing down session");
            reader_shared.teardown();
        });

        info!("Connected to {}", ws_url);
        Ok(Self {
            sink: tokio::sync::Mutex::new(sink),
            shared,
            next_id: AtomicU64::new(0),
            reader,
            config,
            target_session: Mutex::new(None),
        })
    }

    /// Connect to the browser-level endpoint of a local Chrome.
    pub async fn connect_to_browser(port: u16) -> Result<Self> {
        let ws_url = super::discovery::debugger_ws_url(port).await?;
        Self::connect(&ws_url, SessionConfig::default()).await
    }

    /// Whether the underlying connection is still up.
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Send a browser-level command and await its result.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.send_raw(method, params, None).await
    }

    /// Send a command scoped to the attached page target.
    pub async fn send_to_target(&self, method: &str, params: Value) -> Result<Value> {
        let session_id = self
            .target_session
            .lock()
            .clone()
            .ok_or(TransportError::NoPageTarget)?;
        self.send_raw(method, params, Some(&session_id)).await
    }

    async fn send_raw(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value> {
        if !self.shared.is_alive() {
            return Err(TransportError::ConnectionLost.into());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let mut command = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            command["sessionId"] = Value::String(session_id.to_string());
        }
        debug!("-> {} (id={})", method, id);

        let frame = WsMessage::Text(command.to_string());
        if let Err(e) = self.sink.lock().await.send(frame).await {
            self.shared.pending.lock().remove(&id);
            warn!("Send failed for '{}': {}", method, e);
            return Err(TransportError::ConnectionLost.into());
        }

        match tokio::time::timeout(self.config.command_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(TransportError::Command { message, .. }))) => {
                Err(TransportError::Command {
                    method: method.to_string(),
                    message,
                }
                .into())
            }
            Ok(Ok(Err(e))) => Err(e.into()),
            // Sender dropped without answering: the reader tore down.
            Ok(Err(_)) => Err(TransportError::ConnectionLost.into()),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                self.shared.note_timeout(id);
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.config.command_timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Subscribe to an event method. Events are delivered in arrival order;
    /// a full buffer drops the newest event for that subscriber only.
    pub fn subscribe(&self, method: &str) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(self.config.event_buffer);
        self.shared
            .subscribers
            .lock()
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Attach to the first non-DevTools page target and enable the domains
    /// needed for structure, content and paint queries. Failures here are
    /// fatal to the session.
    #[instrument(skip(self))]
    pub async fn attach_first_page(&self) -> Result<String> {
        let targets = self.send("Target.getTargets", json!({})).await?;
        let infos = targets
            .get("targetInfos")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                TransportError::MalformedResponse("Target.getTargets without targetInfos".into())
            })?;

        let page = infos
            .iter()
            .find(|t| {
                t.get("type").and_then(Value::as_str) == Some("page")
                    && !t
                        .get("url")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .starts_with("devtools://")
            })
            .ok_or(TransportError::NoPageTarget)?;
        let target_id = page
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::MalformedResponse("target without targetId".into()))?;

        let attached = self
            .send(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TransportError::MalformedResponse("attachToTarget without sessionId".into())
            })?
            .to_string();
        *self.target_session.lock() = Some(session_id.clone());
        info!("Attached to target {} (session {})", target_id, session_id);

        for domain in ["Page.enable", "DOM.enable", "Runtime.enable"] {
            self.send_to_target(domain, json!({})).await?;
        }
        Ok(session_id)
    }

    /// Evaluate a JavaScript expression in the attached page, returning the
    /// by-value result.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .send_to_target(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            return Err(TransportError::Command {
                method: "Runtime.evaluate".to_string(),
                message: details
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("JavaScript exception")
                    .to_string(),
            }
            .into());
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Close the session, failing any remaining waiters.
    pub async fn close(self) {
        let _ = self.sink.lock().await.send(WsMessage::Close(None)).await;
        self.reader.abort();
        self.shared.teardown();
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        self.reader.abort();
        self.shared.teardown();
    }
}
