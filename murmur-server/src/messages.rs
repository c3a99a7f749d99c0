use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::key::{ConversationKey, ConversationRef};
use crate::live::LiveEvent;
use crate::models::{Message, NewMessage};

/// Frames a client sends to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Connect {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    History {
        conversation: ConversationRef,
    },
    Subscribe {
        conversation: ConversationRef,
    },
    Unsubscribe {
        conversation: ConversationRef,
    },
    Send {
        message: NewMessage,
    },
    Delete {
        message_id: String,
    },
}

/// Frames the server sends to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthResponse {
        success: bool,
        message: String,
    },
    History {
        key: ConversationKey,
        messages: Vec<Message>,
    },
    HistoryFailed {
        key: ConversationKey,
        code: String,
        message: String,
    },
    Subscribed {
        key: ConversationKey,
    },
    Unsubscribed {
        key: ConversationKey,
    },
    Sent {
        message: Message,
    },
    MessageCreated {
        key: ConversationKey,
        message: Message,
    },
    MessageDeleted {
        key: ConversationKey,
        message_id: String,
    },
    Deleted {
        message_id: String,
    },
    DeleteFailed {
        message_id: String,
        code: String,
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(e: &ChatError) -> Self {
        ServerMessage::Error {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

impl From<LiveEvent> for ServerMessage {
    fn from(event: LiveEvent) -> Self {
        match event {
            LiveEvent::Created { key, message } => ServerMessage::MessageCreated { key, message },
            LiveEvent::Deleted { key, message_id } => {
                ServerMessage::MessageDeleted { key, message_id }
            }
        }
    }
}
