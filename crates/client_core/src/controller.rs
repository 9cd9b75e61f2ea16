use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shared::{
    domain::{BrowserKey, ChatId, MessageId},
    error::ChatError,
    protocol::{
        ChatMessage, EditedMessage, HistoryPage, RemoteAppConfig, SendMessageResponse,
        UploadResponse, UserProfile,
    },
};
use storage::SessionStore;

use crate::{
    realtime::{ConnectionState, RealtimeChannel, RealtimeEvent, ReconnectPolicy},
    rest::{ProgressCallback, RestGateway, DEFAULT_REQUEST_TIMEOUT},
};

/// Caller-supplied SDK configuration. The realtime endpoint normally comes
/// from the remote config; `socket_url` overrides it when set.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub app_key: String,
    pub app_secret: String,
    pub base_url: String,
    pub socket_url: Option<String>,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            app_key: app_key.into(),
            app_secret: app_secret.into(),
            base_url: base_url.into(),
            socket_url: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_socket_url(mut self, socket_url: impl Into<String>) -> Self {
        self.socket_url = Some(socket_url.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    Ready,
    NotReady { reason: String },
    Message(ChatMessage),
    Typing { is_typing: bool },
    Connection(ConnectionState),
    IdentityRotated(BrowserKey),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub chat_id: Option<ChatId>,
    pub welcome_messages: Vec<ChatMessage>,
}

struct ControllerInner {
    phase: ControllerPhase,
    config: Option<RemoteAppConfig>,
    browser_key: Option<BrowserKey>,
    chat_id: Option<ChatId>,
}

/// Owns the browser identity and keeps the store, the realtime room and the
/// REST session aligned across registration, reconnection and identity
/// rotation.
pub struct SessionController {
    gateway: RestGateway,
    channel: Arc<RealtimeChannel>,
    store: SessionStore,
    events: broadcast::Sender<ChatEvent>,
    socket_url_override: Option<String>,
    inner: Mutex<ControllerInner>,
    /// Serializes concurrent `initialize()` calls so the config is fetched
    /// at most once per transition into `Ready`.
    init_lock: Mutex<()>,
}

impl SessionController {
    pub fn new(config: ClientConfig, store: SessionStore) -> Result<Arc<Self>, ChatError> {
        let gateway = RestGateway::new(
            &config.base_url,
            &config.app_key,
            &config.app_secret,
            config.request_timeout,
        )?;
        let channel = RealtimeChannel::new(config.reconnect.clone());
        let (events, _) = broadcast::channel(256);
        let controller = Arc::new(Self {
            gateway,
            channel,
            store,
            events,
            socket_url_override: config.socket_url,
            inner: Mutex::new(ControllerInner {
                phase: ControllerPhase::Uninitialized,
                config: None,
                browser_key: None,
                chat_id: None,
            }),
            init_lock: Mutex::new(()),
        });
        controller.spawn_event_forwarder();
        Ok(controller)
    }

    pub fn events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Live messages only; lagged windows are skipped silently.
    pub fn message_stream(&self) -> impl Stream<Item = ChatMessage> {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| match event {
            Ok(ChatEvent::Message(message)) => Some(message),
            _ => None,
        })
    }

    pub async fn phase(&self) -> ControllerPhase {
        self.inner.lock().await.phase
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.channel.connection_state().await
    }

    pub async fn is_registered(&self) -> bool {
        self.store.is_registered().await.unwrap_or(false)
    }

    /// Fetches the remote config, restores any persisted identity and starts
    /// the realtime connection. Idempotent once ready: a second call resolves
    /// without another fetch.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), ChatError> {
        let _guard = self.init_lock.lock().await;
        {
            let mut inner = self.inner.lock().await;
            if inner.phase == ControllerPhase::Ready {
                return Ok(());
            }
            inner.phase = ControllerPhase::Initializing;
        }

        let config = match self.gateway.get_config().await {
            Ok(config) => config,
            Err(err) => {
                self.fail_initialization(&err).await;
                return Err(err);
            }
        };
        if !config.is_active {
            let err = ChatError::ConfigInactive;
            self.fail_initialization(&err).await;
            return Err(err);
        }

        let (stored_key, stored_chat) = match self.restore_identity().await {
            Ok(restored) => restored,
            Err(err) => {
                self.fail_initialization(&err).await;
                return Err(err);
            }
        };

        let endpoint = self
            .socket_url_override
            .clone()
            .unwrap_or_else(|| config.socket_url.clone());
        self.channel
            .connect(&endpoint, &config.socket_api_key, stored_key.clone())
            .await;

        {
            let mut inner = self.inner.lock().await;
            inner.config = Some(config);
            inner.browser_key = stored_key;
            inner.chat_id = stored_chat;
            inner.phase = ControllerPhase::Ready;
        }
        let _ = self.events.send(ChatEvent::Ready);
        info!("chat session ready");
        Ok(())
    }

    /// Validates the server-declared required fields locally, registers the
    /// browser and adopts the returned identity. No network call is made
    /// when a required field is missing.
    pub async fn register(
        &self,
        fields: HashMap<String, Value>,
        endpoint: Option<&str>,
    ) -> Result<RegisterOutcome, ChatError> {
        let config = self.ready_config().await?;
        for field in &config.required_fields {
            if !field.required {
                continue;
            }
            if !field_present(&fields, &field.name) {
                return Err(ChatError::MissingRequiredField {
                    field: field.name.clone(),
                });
            }
        }

        let response = self.gateway.register_browser(&fields, endpoint).await?;
        self.adopt_browser_key(response.browser_key.clone()).await?;

        let mut profile = UserProfile::from_fields(fields);
        profile.registered = true;
        profile.registration_date = Some(Utc::now());
        self.store.set_profile(&profile).await.map_err(storage_error)?;

        if let Some(chat_id) = response.chat_id {
            self.remember_chat_id(chat_id).await?;
        }
        info!(browser_key = %response.browser_key, "browser registered");

        Ok(RegisterOutcome {
            chat_id: response.chat_id,
            welcome_messages: response.last_messages.unwrap_or_default(),
        })
    }

    /// Full profile replace on the server, persisted locally with the
    /// original registration stamps.
    pub async fn update_profile(
        &self,
        fields: HashMap<String, Value>,
    ) -> Result<RegisterOutcome, ChatError> {
        let browser_key = self.ready_identity().await?;
        let response = self.gateway.update_browser(&browser_key, &fields).await?;

        let existing = self.store.profile().await.map_err(storage_error)?;
        let mut profile = UserProfile::from_fields(fields);
        if let Some(existing) = existing {
            profile.registered = existing.registered;
            profile.registration_date = existing.registration_date;
        }
        self.store.set_profile(&profile).await.map_err(storage_error)?;

        if let Some(chat_id) = response.chat_id {
            self.remember_chat_id(chat_id).await?;
        }

        Ok(RegisterOutcome {
            chat_id: response.chat_id,
            welcome_messages: response.last_messages.unwrap_or_default(),
        })
    }

    /// Merge-only update; the server's returned profile is what gets
    /// persisted.
    pub async fn update_profile_fields(
        &self,
        partial: HashMap<String, Value>,
    ) -> Result<UserProfile, ChatError> {
        let browser_key = self.ready_identity().await?;
        let response = self.gateway.update_user_data(&browser_key, &partial).await?;

        let existing = self.store.profile().await.map_err(storage_error)?;
        let mut profile = UserProfile::from_fields(response.user_data);
        if let Some(existing) = existing {
            profile.registered = existing.registered;
            profile.registration_date = existing.registration_date;
        }
        self.store.set_profile(&profile).await.map_err(storage_error)?;
        Ok(profile)
    }

    pub async fn send_message(
        &self,
        text: &str,
        endpoint: Option<&str>,
        metadata: Option<&HashMap<String, Value>>,
    ) -> Result<SendMessageResponse, ChatError> {
        let browser_key = self.ready_identity().await?;
        let response = self
            .gateway
            .send_message(&browser_key, text, endpoint, metadata)
            .await?;
        self.remember_chat_id(response.chat_id).await?;
        // An immediate agent reply rides the same stream as realtime ones.
        if let Some(ai_message) = &response.ai_message {
            let _ = self.events.send(ChatEvent::Message(ai_message.clone()));
        }
        Ok(response)
    }

    pub async fn edit_message(
        &self,
        message_id: MessageId,
        content: &str,
    ) -> Result<EditedMessage, ChatError> {
        let browser_key = self.ready_identity().await?;
        let response = self
            .gateway
            .edit_message(&browser_key, message_id, content)
            .await?;
        Ok(response.message)
    }

    pub async fn send_attachment(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        endpoint: Option<&str>,
        progress: Option<ProgressCallback>,
        cancel: Option<CancellationToken>,
    ) -> Result<UploadResponse, ChatError> {
        let browser_key = self.ready_identity().await?;
        self.gateway
            .upload_attachment(&browser_key, bytes, filename, endpoint, progress, cancel)
            .await
    }

    pub async fn fetch_history(&self, page: u32, per_page: u32) -> Result<HistoryPage, ChatError> {
        let browser_key = self.current_identity().await?;
        self.gateway.get_messages(&browser_key, page, per_page).await
    }

    /// Resume-on-launch path: best effort, never an error. A fresh device or
    /// any fetch failure yields the empty page.
    pub async fn load_history_for_resume(&self, page: u32, per_page: u32) -> HistoryPage {
        let in_memory = { self.inner.lock().await.browser_key.clone() };
        let browser_key = match in_memory {
            Some(key) => Some(key),
            None => match self.store.browser_key().await {
                Ok(Some(key)) => {
                    self.inner.lock().await.browser_key = Some(key.clone());
                    Some(key)
                }
                Ok(None) => None,
                Err(err) => {
                    warn!(error = %err, "resume: identity load failed");
                    None
                }
            },
        };
        let Some(browser_key) = browser_key else {
            return HistoryPage::empty(page, per_page);
        };
        match self.store.profile().await {
            Ok(Some(_)) => {}
            _ => return HistoryPage::empty(page, per_page),
        }
        match self.gateway.get_messages(&browser_key, page, per_page).await {
            Ok(history) => history,
            Err(err) => {
                warn!(error = %err, "resume: history fetch failed, degrading to empty page");
                HistoryPage::empty(page, per_page)
            }
        }
    }

    pub async fn send_typing_indicator(&self, is_typing: bool) {
        let browser_key = { self.inner.lock().await.browser_key.clone() };
        if let Some(browser_key) = browser_key {
            self.channel.send_typing(&browser_key, is_typing).await;
        }
    }

    /// Clears all persisted session state and disconnects. `initialize()`
    /// must run again before further use.
    pub async fn reset(&self) -> Result<(), ChatError> {
        self.store.clear_all().await.map_err(storage_error)?;
        {
            let mut inner = self.inner.lock().await;
            inner.browser_key = None;
            inner.chat_id = None;
            inner.config = None;
            inner.phase = ControllerPhase::Uninitialized;
        }
        self.channel.disconnect().await;
        info!("chat session reset");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
    }

    /// Restarts the realtime connection with the remembered endpoint, auth
    /// key and identity. No-op when the config was never fetched.
    pub async fn reconnect(self: &Arc<Self>) {
        let remembered = {
            let inner = self.inner.lock().await;
            inner.config.as_ref().map(|config| {
                (
                    self.socket_url_override
                        .clone()
                        .unwrap_or_else(|| config.socket_url.clone()),
                    config.socket_api_key.clone(),
                    inner.browser_key.clone(),
                )
            })
        };
        if let Some((endpoint, auth_key, browser_key)) = remembered {
            self.channel.connect(&endpoint, &auth_key, browser_key).await;
        }
    }

    /// The single mutation point for the active identity: the store write
    /// and the realtime room switch happen under the controller guard, so no
    /// other identity mutation can observe a partial pair.
    async fn adopt_browser_key(&self, key: BrowserKey) -> Result<(), ChatError> {
        let mut inner = self.inner.lock().await;
        self.store.set_browser_key(&key).await.map_err(storage_error)?;
        inner.browser_key = Some(key.clone());
        self.channel.update_identity(key).await;
        Ok(())
    }

    async fn restore_identity(&self) -> Result<(Option<BrowserKey>, Option<ChatId>), ChatError> {
        let key = self.store.browser_key().await.map_err(storage_error)?;
        let chat_id = self.store.chat_id().await.map_err(storage_error)?;
        Ok((key, chat_id))
    }

    async fn remember_chat_id(&self, chat_id: ChatId) -> Result<(), ChatError> {
        let changed = {
            let mut inner = self.inner.lock().await;
            if inner.chat_id == Some(chat_id) {
                false
            } else {
                inner.chat_id = Some(chat_id);
                true
            }
        };
        if changed {
            self.store.set_chat_id(chat_id).await.map_err(storage_error)?;
        }
        Ok(())
    }

    async fn ready_config(&self) -> Result<RemoteAppConfig, ChatError> {
        let inner = self.inner.lock().await;
        if inner.phase != ControllerPhase::Ready {
            return Err(ChatError::NotInitialized);
        }
        inner.config.clone().ok_or(ChatError::NotInitialized)
    }

    async fn ready_identity(&self) -> Result<BrowserKey, ChatError> {
        let inner = self.inner.lock().await;
        if inner.phase != ControllerPhase::Ready {
            return Err(ChatError::NotInitialized);
        }
        inner.browser_key.clone().ok_or(ChatError::NotRegistered)
    }

    async fn current_identity(&self) -> Result<BrowserKey, ChatError> {
        let inner = self.inner.lock().await;
        inner.browser_key.clone().ok_or(ChatError::NotRegistered)
    }

    async fn fail_initialization(&self, err: &ChatError) {
        {
            let mut inner = self.inner.lock().await;
            inner.phase = ControllerPhase::Failed;
        }
        let _ = self.events.send(ChatEvent::NotReady {
            reason: err.to_string(),
        });
    }

    /// One subscription for the controller lifetime; every channel event is
    /// republished verbatim, with identity rotations routed through the
    /// central identity setter first.
    fn spawn_event_forwarder(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let mut channel_events = self.channel.subscribe();
        tokio::spawn(async move {
            loop {
                match channel_events.recv().await {
                    Ok(RealtimeEvent::Message(message)) => {
                        let _ = controller.events.send(ChatEvent::Message(message));
                    }
                    Ok(RealtimeEvent::Typing { is_typing }) => {
                        let _ = controller.events.send(ChatEvent::Typing { is_typing });
                    }
                    Ok(RealtimeEvent::Connection(state)) => {
                        let _ = controller.events.send(ChatEvent::Connection(state));
                    }
                    Ok(RealtimeEvent::BrowserKeyUpdated(key)) => {
                        if let Err(err) = controller.adopt_browser_key(key.clone()).await {
                            let _ = controller
                                .events
                                .send(ChatEvent::Error(err.to_string()));
                            continue;
                        }
                        info!(browser_key = %key, "browser identity rotated by server");
                        let _ = controller.events.send(ChatEvent::IdentityRotated(key));
                    }
                    Ok(RealtimeEvent::AuthError { message }) => {
                        let _ = controller.events.send(ChatEvent::Error(message));
                    }
                    Ok(RealtimeEvent::Error(message)) => {
                        let _ = controller.events.send(ChatEvent::Error(message));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

fn field_present(fields: &HashMap<String, Value>, name: &str) -> bool {
    match fields.get(name) {
        Some(Value::String(value)) => !value.trim().is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

fn storage_error(err: anyhow::Error) -> ChatError {
    ChatError::Storage(err.to_string())
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
