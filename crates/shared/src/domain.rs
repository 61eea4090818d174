use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChatId);
id_newtype!(MessageId);

/// The chat resources the backend exposes a realtime stream for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChatKind {
    ServiceChats,
    SupportChats,
    DisputeChats,
}

impl ChatKind {
    /// Path segment shared by the REST collection and the `/ws/<kind>` route.
    pub fn path_segment(self) -> &'static str {
        match self {
            ChatKind::ServiceChats => "service-chats",
            ChatKind::SupportChats => "support-chats",
            ChatKind::DisputeChats => "dispute-chats",
        }
    }
}

impl std::str::FromStr for ChatKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "service" | "service-chats" => Ok(ChatKind::ServiceChats),
            "support" | "support-chats" => Ok(ChatKind::SupportChats),
            "dispute" | "dispute-chats" => Ok(ChatKind::DisputeChats),
            other => Err(format!("unknown chat kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    Moderator,
    Arbitr,
}
