use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a monitored multi-party thread.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

/// Provider-side identifier of a participant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub String);

/// Provider-side identifier of a message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for MemberId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A participant as reported by the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub handle: String,
}

impl Member {
    pub fn new(id: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            id: MemberId(id.into()),
            handle: handle.into(),
        }
    }

    /// Handle to address the member by; falls back to the id when the provider has none.
    pub fn display_handle(&self) -> &str {
        if self.handle.trim().is_empty() {
            &self.id.0
        } else {
            &self.handle
        }
    }
}

/// A thread message as reported by the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: MemberId,
    pub text: String,
    /// Monotonic position of the message within its thread.
    pub ordinal: i64,
}

/// One read of a group: members plus recent messages (newest first).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub members: Vec<Member>,
    pub messages: Vec<Message>,
}

impl GroupSnapshot {
    pub fn member(&self, id: &MemberId) -> Option<&Member> {
        self.members.iter().find(|m| &m.id == id)
    }
}

/// Opaque authenticated session produced by the provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Member id of the authenticated account (used to ignore our own messages).
    pub self_id: MemberId,
    /// Provider-specific payload; never inspected by the core.
    pub blob: serde_json::Value,
}
