use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, MessageId, Role, UserId};

/// One persisted (or optimistically shown) chat entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    pub chat_id: ChatId,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Frames the backend pushes over a chat socket, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Fan-out of a message persisted for any participant.
    Message(ChatMessage),
    /// Confirmation, sent only to the author, that its message was persisted.
    MessageSent { message: ChatMessage },
    Connected {
        #[serde(default)]
        chat_id: Option<ChatId>,
        #[serde(default)]
        user_id: Option<UserId>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Message { content: String },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeTokenResponse {
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCheckResponse {
    pub status: String,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub about: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub verified_email: bool,
}

/// A chat as returned by `GET /<kind>/<id>`: everything but the history is opaque here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDetail {
    pub id: ChatId,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// The backend emits ISO-8601 timestamps with or without an offset; offset-less
/// values are UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|err| D::Error::custom(format!("invalid timestamp '{raw}': {err}")))
    }
}
