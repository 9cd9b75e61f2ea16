use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{BrowserKey, ChatId, MessageId, SenderKind};

fn default_true() -> bool {
    true
}

/// Server-declared registration field descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
}

/// Remote application metadata, fetched once per controller lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAppConfig {
    pub app_name: String,
    /// Absent on the wire means the application is disabled.
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
    #[serde(default)]
    pub required_fields: Vec<FieldSpec>,
    pub socket_url: String,
    pub socket_api_key: String,
}

const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub content: String,
    pub sender_type: SenderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl ChatMessage {
    /// Derived, never stored: a message renders as an image when the
    /// metadata flag says so, or when the content is a hosted URL with an
    /// image extension.
    pub fn is_image(&self) -> bool {
        if let Some(metadata) = &self.metadata {
            if metadata.get("is_image").and_then(Value::as_bool) == Some(true) {
                return true;
            }
        }

        let content = self.content.trim();
        let hosted = content.starts_with("http://")
            || content.starts_with("https://")
            || content.starts_with("/storage/");
        if !hosted {
            return false;
        }

        let path = content
            .split(['?', '#'])
            .next()
            .unwrap_or(content);
        match path.rsplit_once('.') {
            Some((_, extension)) => {
                IMAGE_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub total: u64,
    /// 1-based page number.
    pub current_page: u32,
    pub per_page: u32,
    pub last_page: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<ChatMessage>,
    pub pagination: Pagination,
}

impl HistoryPage {
    /// The deliberate "nothing to resume" page: zero total, no further pages.
    pub fn empty(page: u32, per_page: u32) -> Self {
        Self {
            messages: Vec::new(),
            pagination: Pagination {
                total: 0,
                current_page: page,
                per_page,
                last_page: page,
                has_more: false,
            },
        }
    }
}

/// Locally persisted user profile. `registered` and `registration_date`
/// are stamped by the controller at registration time, never by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
}

impl UserProfile {
    pub fn from_fields(fields: HashMap<String, Value>) -> Self {
        Self {
            registered: false,
            registration_date: None,
            fields,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterBrowserResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    pub browser_key: BrowserKey,
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    #[serde(default)]
    pub last_messages: Option<Vec<ChatMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateBrowserResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    #[serde(default)]
    pub last_messages: Option<Vec<ChatMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateUserDataResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    pub user_data: HashMap<String, Value>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    pub user_message_id: MessageId,
    pub chat_id: ChatId,
    #[serde(default)]
    pub ai_agent_enabled: bool,
    /// One immediate agent reply may ride along; any further replies arrive
    /// over the realtime channel.
    #[serde(default)]
    pub ai_message: Option<ChatMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditedMessage {
    pub id: MessageId,
    pub content: String,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditMessageResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    pub message: EditedMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub image_url: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// JSON text-frame envelope used in both directions on the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl WireFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}
