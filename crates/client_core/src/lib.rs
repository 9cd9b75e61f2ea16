pub mod controller;
pub mod realtime;
pub mod rest;
pub mod signature;

pub use controller::{
    ChatEvent, ClientConfig, ControllerPhase, RegisterOutcome, SessionController,
};
pub use realtime::{
    ConnectionState, RealtimeChannel, RealtimeEvent, ReconnectPolicy, DEFAULT_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_DELAY,
};
pub use rest::{ProgressCallback, RestGateway, DEFAULT_REQUEST_TIMEOUT};
pub use shared::{
    domain::{BrowserKey, ChatId, MessageId, SenderKind},
    error::ChatError,
    protocol::{
        ChatMessage, EditedMessage, FieldSpec, HistoryPage, Pagination, RemoteAppConfig,
        SendMessageResponse, UploadResponse, UserProfile,
    },
};
pub use storage::{KeyValueStore, MemoryKeyValueStore, SessionStore, SqliteKeyValueStore};
