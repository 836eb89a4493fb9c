//! Message data model shared by the store, the inference session and the
//! turn orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Persona/instruction seed; never rendered.
    System,
    User,
    Assistant,
}

impl Role {
    /// Stored text form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One entry of the conversation log.
///
/// `content` is replaced wholesale while `is_draft` is set and frozen once
/// the message is finalized. Drafts never reach the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Store row id; `None` until persisted.
    pub id: Option<i64>,
    pub role: Role,
    pub content: String,
    pub is_draft: bool,
    /// Survives pruning of the recent-context window.
    pub to_remember: bool,
    /// Unix timestamp (seconds) of finalization.
    pub timestamp: Option<i64>,
}

impl Message {
    /// A finalized message that has not been persisted yet.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            is_draft: false,
            to_remember: false,
            timestamp: Some(chrono::Utc::now().timestamp()),
        }
    }

    /// An in-flight placeholder.
    pub fn draft(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            is_draft: true,
            to_remember: false,
            timestamp: None,
        }
    }

    /// Builder-style `toRemember` flag.
    pub fn remembered(mut self, to_remember: bool) -> Self {
        self.to_remember = to_remember;
        self
    }

    /// The role/content pair sent to the language model.
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// A role-tagged prompt message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn role_round_trips_through_text() {
        for role in [Role::System, Role::User, Role::Assistant] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("narrator".parse::<Role>().is_err());
    }

    #[test]
    fn drafts_have_no_timestamp() {
        let d = Message::draft(Role::User, "hel");
        assert!(d.is_draft);
        assert!(d.timestamp.is_none());
        let m = Message::new(Role::User, "hello").remembered(true);
        assert!(!m.is_draft);
        assert!(m.to_remember);
        assert!(m.timestamp.is_some());
    }
}
