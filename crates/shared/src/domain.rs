use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(ChatId);
id_newtype!(MessageId);

/// Opaque per-device session token issued by the backend. At most one
/// browser key is active per controller; adopting a new one always
/// supersedes the old room membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrowserKey(pub String);

impl BrowserKey {
    /// Name of the private realtime room scoped to this identity.
    pub fn room_name(&self) -> String {
        format!("private-chat_{}", self.0)
    }
}

impl fmt::Display for BrowserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    User,
    Staff,
    Agent,
    System,
}
