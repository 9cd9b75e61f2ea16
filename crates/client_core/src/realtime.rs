use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use shared::{
    domain::BrowserKey,
    protocol::{ChatMessage, WireFrame},
};

pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

const EVENT_AUTH: &str = "auth";
const EVENT_JOIN: &str = "join";
const EVENT_LEAVE: &str = "leave";
const EVENT_TYPING: &str = "typing";
const EVENT_AUTH_ERROR: &str = "auth-error";
const EVENT_BROWSER_KEY_UPDATED: &str = "browser-key-updated";

/// The message broadcast arrives under two equivalent wire spellings: the
/// current colon-delimited namespacing and the legacy backslash-delimited
/// one. Both normalize to the same event.
const CHAT_MESSAGE_EVENTS: [&str; 2] = ["chat:message-created", "chat\\message-created"];
const EXTERNAL_MESSAGE_EVENTS: [&str; 2] = ["chat:external-message", "chat\\external-message"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    Connection(ConnectionState),
    Message(ChatMessage),
    Typing { is_typing: bool },
    /// The server reissued the browser identity; the controller persists it.
    BrowserKeyUpdated(BrowserKey),
    AuthError { message: String },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    ChatMessage,
    Typing,
    BrowserKeyUpdated,
    AuthError,
}

/// Wire-event dispatch table constructed fresh for every physical
/// connection. Binding a wire name that is already bound is a no-op, so a
/// single broadcast can never be delivered twice through one connection and
/// reconnects cannot accumulate handlers.
struct EventBindings {
    bound: HashMap<&'static str, EventKind>,
}

impl EventBindings {
    fn for_connection() -> Self {
        let mut bindings = Self {
            bound: HashMap::new(),
        };
        for name in CHAT_MESSAGE_EVENTS {
            bindings.bind(name, EventKind::ChatMessage);
        }
        for name in EXTERNAL_MESSAGE_EVENTS {
            bindings.bind(name, EventKind::ChatMessage);
        }
        bindings.bind(EVENT_TYPING, EventKind::Typing);
        bindings.bind(EVENT_BROWSER_KEY_UPDATED, EventKind::BrowserKeyUpdated);
        bindings.bind(EVENT_AUTH_ERROR, EventKind::AuthError);
        bindings
    }

    fn bind(&mut self, name: &'static str, kind: EventKind) {
        self.bound.entry(name).or_insert(kind);
    }

    fn resolve(&self, name: &str) -> Option<EventKind> {
        self.bound.get(name).copied()
    }
}

struct ChannelInner {
    endpoint: Option<String>,
    auth_key: Option<String>,
    browser_key: Option<BrowserKey>,
    state: ConnectionState,
    writer: Option<mpsc::Sender<WireFrame>>,
    supervisor: Option<(CancellationToken, JoinHandle<()>)>,
}

enum ConnectionOutcome {
    /// The transport closed or errored after a successful connection.
    Lost,
    Cancelled,
}

/// One persistent duplex connection to the realtime backend: handshake,
/// private-room membership, bounded auto-reconnect, and a normalized event
/// stream.
pub struct RealtimeChannel {
    events: broadcast::Sender<RealtimeEvent>,
    policy: ReconnectPolicy,
    inner: Mutex<ChannelInner>,
}

impl RealtimeChannel {
    pub fn new(policy: ReconnectPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            policy,
            inner: Mutex::new(ChannelInner {
                endpoint: None,
                auth_key: None,
                browser_key: None,
                state: ConnectionState::Disconnected,
                writer: None,
                supervisor: None,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Starts (or restarts) the connection supervisor. The remembered
    /// identity, if any, is joined automatically on every transition into
    /// the connected state.
    pub async fn connect(
        self: &Arc<Self>,
        endpoint: &str,
        auth_key: &str,
        browser_key: Option<BrowserKey>,
    ) {
        let cancel = CancellationToken::new();
        let previous = {
            let mut inner = self.inner.lock().await;
            inner.endpoint = Some(endpoint.to_string());
            inner.auth_key = Some(auth_key.to_string());
            if browser_key.is_some() {
                inner.browser_key = browser_key;
            }
            let channel = Arc::clone(self);
            let task_cancel = cancel.clone();
            let task = tokio::spawn(async move { channel.run_supervisor(task_cancel).await });
            inner.supervisor.replace((cancel, task))
        };
        if let Some((old_cancel, old_task)) = previous {
            old_cancel.cancel();
            old_task.abort();
        }
    }

    /// Adopts a new identity: leaves the previous private room and joins the
    /// new one when connected, otherwise just remembers the identity for the
    /// next connect. Unchanged identity is a no-op with zero traffic.
    pub async fn update_identity(&self, new_key: BrowserKey) {
        let (writer, frames) = {
            let mut inner = self.inner.lock().await;
            if inner.browser_key.as_ref() == Some(&new_key) {
                return;
            }
            let old_key = inner.browser_key.replace(new_key.clone());
            let Some(writer) = inner.writer.clone() else {
                return;
            };
            let mut frames = Vec::new();
            if let Some(old_key) = old_key {
                frames.push(room_frame(EVENT_LEAVE, &old_key));
            }
            frames.push(room_frame(EVENT_JOIN, &new_key));
            (writer, frames)
        };
        for frame in frames {
            if writer.send(frame).await.is_err() {
                // Connection dropped mid-switch; the reconnect handshake
                // will join the new room.
                return;
            }
        }
        info!(browser_key = %new_key, "realtime: switched private room");
    }

    /// Fire-and-forget typing signal; silently dropped while disconnected.
    pub async fn send_typing(&self, browser_key: &BrowserKey, is_typing: bool) {
        let writer = { self.inner.lock().await.writer.clone() };
        if let Some(writer) = writer {
            let frame = WireFrame::new(
                EVENT_TYPING,
                json!({ "browser_key": browser_key.0, "isTyping": is_typing }),
            );
            let _ = writer.send(frame).await;
        }
    }

    /// Terminates the connection and suppresses further reconnect attempts.
    /// The remembered identity survives for a future `connect`. Idempotent.
    pub async fn disconnect(&self) {
        let previous = {
            let mut inner = self.inner.lock().await;
            inner.writer = None;
            inner.supervisor.take()
        };
        if let Some((cancel, task)) = previous {
            cancel.cancel();
            let _ = task.await;
        }
        self.set_state(ConnectionState::Disconnected).await;
    }

    async fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut inner = self.inner.lock().await;
            if inner.state == state {
                false
            } else {
                inner.state = state;
                if state != ConnectionState::Connected {
                    inner.writer = None;
                }
                true
            }
        };
        if changed {
            let _ = self.events.send(RealtimeEvent::Connection(state));
        }
    }

    async fn run_supervisor(self: Arc<Self>, cancel: CancellationToken) {
        let mut attempts_left = self.policy.max_attempts;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let (endpoint, auth_key) = {
                let inner = self.inner.lock().await;
                match (inner.endpoint.clone(), inner.auth_key.clone()) {
                    (Some(endpoint), Some(auth_key)) => (endpoint, auth_key),
                    _ => break,
                }
            };

            self.set_state(ConnectionState::Connecting).await;
            match self.run_connection(&endpoint, &auth_key, &cancel).await {
                Ok(ConnectionOutcome::Cancelled) => break,
                Ok(ConnectionOutcome::Lost) => {
                    // A completed connection earns a fresh attempt budget.
                    attempts_left = self.policy.max_attempts;
                    warn!("realtime: connection lost, reconnecting");
                }
                Err(err) => {
                    warn!(error = %err, "realtime: connection attempt failed");
                }
            }
            self.set_state(ConnectionState::Disconnected).await;

            if attempts_left == 0 {
                info!("realtime: reconnect attempts exhausted; call connect() to resume");
                break;
            }
            attempts_left -= 1;
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.policy.delay) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected).await;
    }

    async fn run_connection(
        self: &Arc<Self>,
        endpoint: &str,
        auth_key: &str,
        cancel: &CancellationToken,
    ) -> Result<ConnectionOutcome, String> {
        let endpoint = websocket_endpoint(endpoint)?;
        let ws_stream = tokio::select! {
            () = cancel.cancelled() => return Ok(ConnectionOutcome::Cancelled),
            connected = connect_async(endpoint.as_str()) => {
                connected.map_err(|err| format!("websocket connect failed: {err}"))?.0
            }
        };
        let (mut sink, mut reader) = ws_stream.split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<WireFrame>(64);

        let browser_key = {
            let mut inner = self.inner.lock().await;
            inner.writer = Some(writer_tx);
            inner.state = ConnectionState::Connected;
            inner.browser_key.clone()
        };
        let _ = self
            .events
            .send(RealtimeEvent::Connection(ConnectionState::Connected));

        // Handshake, then rejoin the private room. This runs identically on
        // the first connect and on every reconnect.
        let mut auth_data = json!({ "key": auth_key });
        if let Some(key) = &browser_key {
            auth_data["browser_key"] = json!(key.0);
        }
        send_frame(&mut sink, &WireFrame::new(EVENT_AUTH, auth_data)).await?;
        if let Some(key) = &browser_key {
            send_frame(&mut sink, &room_frame(EVENT_JOIN, key)).await?;
            info!(room = %key.room_name(), "realtime: joined private room");
        }

        let bindings = EventBindings::for_connection();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(ConnectionOutcome::Cancelled);
                }
                outgoing = writer_rx.recv() => {
                    let Some(frame) = outgoing else {
                        return Ok(ConnectionOutcome::Lost);
                    };
                    send_frame(&mut sink, &frame).await?;
                }
                incoming = reader.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.dispatch(&bindings, &text),
                        Some(Ok(Message::Close(_))) | None => return Ok(ConnectionOutcome::Lost),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "realtime: receive failed");
                            return Ok(ConnectionOutcome::Lost);
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, bindings: &EventBindings, text: &str) {
        let frame: WireFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = self
                    .events
                    .send(RealtimeEvent::Error(format!("invalid wire frame: {err}")));
                return;
            }
        };
        let Some(kind) = bindings.resolve(frame.event.as_str()) else {
            return;
        };
        match kind {
            EventKind::ChatMessage => match serde_json::from_value::<ChatMessage>(frame.data) {
                Ok(message) => {
                    let _ = self.events.send(RealtimeEvent::Message(message));
                }
                Err(err) => {
                    let _ = self.events.send(RealtimeEvent::Error(format!(
                        "malformed chat message payload: {err}"
                    )));
                }
            },
            EventKind::Typing => {
                let is_typing = frame
                    .data
                    .get("isTyping")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let _ = self.events.send(RealtimeEvent::Typing { is_typing });
            }
            EventKind::BrowserKeyUpdated => {
                match frame.data.get("browser_key").and_then(Value::as_str) {
                    Some(key) => {
                        let _ = self
                            .events
                            .send(RealtimeEvent::BrowserKeyUpdated(BrowserKey(key.to_string())));
                    }
                    None => {
                        let _ = self.events.send(RealtimeEvent::Error(
                            "browser-key-updated event without browser_key".to_string(),
                        ));
                    }
                }
            }
            EventKind::AuthError => {
                let message = frame
                    .data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("realtime authentication rejected")
                    .to_string();
                warn!(%message, "realtime: auth error");
                let _ = self.events.send(RealtimeEvent::AuthError { message });
            }
        }
    }
}

fn room_frame(event: &str, key: &BrowserKey) -> WireFrame {
    WireFrame::new(event, json!({ "room": key.room_name() }))
}

async fn send_frame<S>(sink: &mut S, frame: &WireFrame) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let encoded =
        serde_json::to_string(frame).map_err(|err| format!("frame encode failed: {err}"))?;
    sink.send(Message::Text(encoded))
        .await
        .map_err(|err| format!("websocket send failed: {err}"))
}

/// Accepts ws/wss endpoints directly and rewrites http/https ones, so the
/// remote config may hand out either form.
fn websocket_endpoint(endpoint: &str) -> Result<Url, String> {
    let mut url =
        Url::parse(endpoint).map_err(|err| format!("invalid realtime endpoint: {err}"))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(format!("unsupported realtime scheme: {other}")),
    };
    if url.set_scheme(scheme).is_err() {
        return Err(format!("cannot rewrite scheme for endpoint {endpoint}"));
    }
    Ok(url)
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
