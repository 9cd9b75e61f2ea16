use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::RwLock;

use shared::{
    domain::{BrowserKey, ChatId},
    protocol::UserProfile,
};

/// Minimal string key-value contract the session layer persists through.
/// A missing key is `None`, never an error.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;
    async fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteKeyValueStore {
    pool: Pool<Sqlite>,
}

impl SqliteKeyValueStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let store = Self { pool };
        store.ensure_kv_table().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn ensure_kv_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_kv (
                namespace  TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (namespace, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create chat_kv table")?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM chat_kv WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<String, _>(0)))
    }

    async fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chat_kv (namespace, key, value)
            VALUES (?, ?, ?)
            ON CONFLICT (namespace, key)
            DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM chat_kv WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-process store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<(String, String), String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

const BROWSER_KEY_ENTRY: &str = "browser_key";
const PROFILE_ENTRY: &str = "user_profile";
const CHAT_ID_ENTRY: &str = "chat_id";

/// Durable session state for one application key. All entries live under a
/// namespace derived from the app key, so multiple app configurations on one
/// device never collide.
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, app_key: &str) -> Self {
        Self {
            kv,
            namespace: format!("chat-app:{app_key}"),
        }
    }

    pub async fn browser_key(&self) -> Result<Option<BrowserKey>> {
        let value = self.kv.get(&self.namespace, BROWSER_KEY_ENTRY).await?;
        Ok(value.map(BrowserKey))
    }

    pub async fn set_browser_key(&self, key: &BrowserKey) -> Result<()> {
        self.kv.set(&self.namespace, BROWSER_KEY_ENTRY, &key.0).await
    }

    pub async fn clear_browser_key(&self) -> Result<()> {
        self.kv.delete(&self.namespace, BROWSER_KEY_ENTRY).await
    }

    pub async fn profile(&self) -> Result<Option<UserProfile>> {
        let Some(raw) = self.kv.get(&self.namespace, PROFILE_ENTRY).await? else {
            return Ok(None);
        };
        let profile =
            serde_json::from_str(&raw).context("stored user profile is not valid JSON")?;
        Ok(Some(profile))
    }

    pub async fn set_profile(&self, profile: &UserProfile) -> Result<()> {
        let encoded = serde_json::to_string(profile).context("failed to encode user profile")?;
        self.kv.set(&self.namespace, PROFILE_ENTRY, &encoded).await
    }

    pub async fn clear_profile(&self) -> Result<()> {
        self.kv.delete(&self.namespace, PROFILE_ENTRY).await
    }

    pub async fn chat_id(&self) -> Result<Option<ChatId>> {
        let Some(raw) = self.kv.get(&self.namespace, CHAT_ID_ENTRY).await? else {
            return Ok(None);
        };
        let id = raw
            .parse::<i64>()
            .context("stored chat id is not an integer")?;
        Ok(Some(ChatId(id)))
    }

    pub async fn set_chat_id(&self, chat_id: ChatId) -> Result<()> {
        self.kv
            .set(&self.namespace, CHAT_ID_ENTRY, &chat_id.0.to_string())
            .await
    }

    /// True iff a profile exists and it carries the `registered` stamp.
    pub async fn is_registered(&self) -> Result<bool> {
        Ok(self
            .profile()
            .await?
            .is_some_and(|profile| profile.registered))
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.clear_browser_key().await?;
        self.clear_profile().await?;
        self.kv.delete(&self.namespace, CHAT_ID_ENTRY).await
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path_from_url(database_url) else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
    }
    Ok(())
}

fn sqlite_path_from_url(database_url: &str) -> Option<PathBuf> {
    let raw = database_url.strip_prefix("sqlite://")?;
    if raw.is_empty() || raw.starts_with(':') {
        return None;
    }
    Some(Path::new(raw).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
