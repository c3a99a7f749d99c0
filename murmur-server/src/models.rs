//! Message records and the validated input used to create them.

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};
use crate::key::ConversationKey;

pub const MAX_ID_LENGTH: usize = 128;
pub const MAX_TEXT_LENGTH: usize = 10000;
/// Base64 payload limit, roughly 7.5 MB decoded
pub const MAX_ATTACHMENT_LENGTH: usize = 10 * 1024 * 1024;
const MAX_FILE_NAME_LENGTH: usize = 255;

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub group_id: Option<String>,
    pub text: Option<String>,
    pub image: Option<String>,
    pub file: Option<String>,
    /// Storage handles stay on the server
    #[serde(default, skip_serializing)]
    pub image_handle: Option<String>,
    #[serde(default, skip_serializing)]
    pub file_handle: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Message {
    pub fn conversation_key(&self) -> ConversationKey {
        match (&self.group_id, &self.receiver_id) {
            (Some(group_id), _) => ConversationKey::group(group_id.clone()),
            (None, Some(receiver_id)) => ConversationKey::direct(&self.sender_id, receiver_id),
            (None, None) => ConversationKey::direct(&self.sender_id, &self.sender_id),
        }
    }

    /// Storage handles that must be purged when this message goes away
    pub fn blob_handles(&self) -> Vec<String> {
        self.image_handle
            .iter()
            .chain(self.file_handle.iter())
            .cloned()
            .collect()
    }
}

/// Inline attachment, base64 encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[garde(context(()))]
pub struct Attachment {
    #[garde(length(min = 1, max = MAX_FILE_NAME_LENGTH))]
    pub file_name: Option<String>,
    #[garde(length(min = 1, max = MAX_ATTACHMENT_LENGTH))]
    pub data: String,
}

impl Attachment {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            file_name: None,
            data: data.into(),
        }
    }
}

/// Payload of a send request. The sender comes from the authenticated connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[garde(context(()))]
pub struct NewMessage {
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub receiver_id: Option<String>,
    #[garde(length(min = 1, max = MAX_ID_LENGTH))]
    pub group_id: Option<String>,
    #[garde(length(max = MAX_TEXT_LENGTH))]
    pub text: Option<String>,
    #[garde(dive)]
    pub image: Option<Attachment>,
    #[garde(dive)]
    pub file: Option<Attachment>,
}

impl NewMessage {
    pub fn text_to(receiver_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            receiver_id: Some(receiver_id.into()),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn text_to_group(group_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    /// Field bounds, then routing, then content
    pub fn check(&self, sender_id: &str) -> Result<()> {
        if sender_id.is_empty() || sender_id.len() > MAX_ID_LENGTH {
            return Err(ChatError::Validation("sender id is required".to_string()));
        }
        self.validate()?;

        match (&self.receiver_id, &self.group_id) {
            (Some(_), Some(_)) => {
                return Err(ChatError::Validation(
                    "message cannot target both a receiver and a group".to_string(),
                ))
            }
            (None, None) => {
                return Err(ChatError::Validation(
                    "message needs a receiver or a group".to_string(),
                ))
            }
            _ => {}
        }

        if !self.has_text() && self.image.is_none() && self.file.is_none() {
            return Err(ChatError::Validation(
                "message needs text, an image or a file".to_string(),
            ));
        }
        Ok(())
    }
}
