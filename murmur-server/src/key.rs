use std::fmt;

use serde::{Deserialize, Serialize};

/// Conversation as addressed by a client, relative to its own identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationRef {
    Direct { user_id: String },
    Group { group_id: String },
}

impl ConversationRef {
    pub fn direct(user_id: impl Into<String>) -> Self {
        ConversationRef::Direct {
            user_id: user_id.into(),
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        ConversationRef::Group {
            group_id: group_id.into(),
        }
    }

    /// Resolve against the viewer identity into the canonical key
    pub fn key_for(&self, viewer: &str) -> ConversationKey {
        match self {
            ConversationRef::Direct { user_id } => ConversationKey::direct(viewer, user_id),
            ConversationRef::Group { group_id } => ConversationKey::group(group_id.clone()),
        }
    }
}

/// Canonical address of a conversation.
///
/// Direct keys keep the two participants sorted so that both sides land on the
/// same key regardless of who opened the conversation first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationKey {
    Direct { participants: (String, String) },
    Group { group_id: String },
}

impl ConversationKey {
    pub fn direct(a: &str, b: &str) -> Self {
        let participants = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        ConversationKey::Direct { participants }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        ConversationKey::Group {
            group_id: group_id.into(),
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        match self {
            ConversationKey::Direct { participants: (a, b) } => a == user_id || b == user_id,
            ConversationKey::Group { .. } => true,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::Direct { participants: (a, b) } => write!(f, "direct:{}:{}", a, b),
            ConversationKey::Group { group_id } => write!(f, "group:{}", group_id),
        }
    }
}
