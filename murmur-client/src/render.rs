//! Sender/receiver presentation of a message as plain data.

use chrono::{DateTime, Utc};
use murmur_server::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Written by the viewer
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: String,
    pub side: Side,
    pub text: Option<String>,
    pub image: Option<String>,
    pub file: Option<String>,
    pub time_label: String,
    pub can_copy: bool,
    pub can_download: bool,
    pub can_delete: bool,
    pub download_name: Option<String>,
    /// A delete for this message is in flight
    pub deleting: bool,
}

/// Describe how `message` looks to `viewer`
pub fn describe(message: &Message, viewer: &str) -> MessageView {
    let own = message.sender_id == viewer;
    let has_text = message.text.as_deref().is_some_and(|t| !t.is_empty());
    let can_download = own && message.image.is_some();

    MessageView {
        id: message.id.clone(),
        side: if own { Side::Outgoing } else { Side::Incoming },
        text: message.text.clone(),
        image: message.image.clone(),
        file: message.file.clone(),
        time_label: format_time(message.created_at),
        can_copy: has_text && message.image.is_none(),
        can_download,
        can_delete: own,
        download_name: can_download.then(|| format!("chat-image-{}", message.id)),
        deleting: false,
    }
}

/// `HH:MM` in UTC
pub fn format_time(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".to_string())
}
