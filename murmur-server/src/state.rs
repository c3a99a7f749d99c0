use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::blobs::LocalBlobStore;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::key::{ConversationKey, ConversationRef};
use crate::live::{EventSink, LiveChannel, LiveEvent, Subscription};
use crate::models::{Message, NewMessage};
use crate::store::{Deletion, MessageStore};

/// Shared server state: the message store plus the live channel fed by its writes
pub struct ServerState {
    pub store: MessageStore,
    pub live: Arc<LiveChannel>,
    access_token: Option<String>,
    auth_timeout: Duration,
}

impl ServerState {
    pub fn new(store: MessageStore) -> Self {
        let defaults = ServerConfig::default();
        Self {
            store,
            live: LiveChannel::new(),
            access_token: None,
            auth_timeout: defaults.auth_timeout,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let blobs = Arc::new(LocalBlobStore::new(&config.blob_dir, &config.blob_base_url)?);
        let store = MessageStore::open(&config.database_path, blobs)?;
        Ok(Self {
            store,
            live: LiveChannel::new(),
            access_token: config.access_token.clone(),
            auth_timeout: config.auth_timeout,
        })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn auth_timeout(&self) -> Duration {
        self.auth_timeout
    }

    /// Check a presented token against the configured one, if any
    pub fn authorize(&self, token: Option<&str>) -> bool {
        match self.access_token.as_deref() {
            Some(expected) => token == Some(expected),
            None => true,
        }
    }

    /// Persist, then announce to the conversation. The announcement cannot undo the write.
    pub fn send_message(&self, sender_id: &str, input: NewMessage) -> Result<Message> {
        let message = self.store.create(sender_id, input)?;
        let key = message.conversation_key();
        let reached = self.live.publish(&LiveEvent::Created {
            key: key.clone(),
            message: message.clone(),
        });
        info!(id = %message.id, key = %key, reached, "Message sent");
        Ok(message)
    }

    pub fn delete_message(&self, message_id: &str, requester: &str) -> Result<Deletion> {
        let deletion = self.store.delete_by_id(message_id, requester)?;
        let reached = self.live.publish(&LiveEvent::Deleted {
            key: deletion.key.clone(),
            message_id: deletion.message_id.clone(),
        });
        info!(id = %message_id, key = %deletion.key, reached, "Message deleted");
        Ok(deletion)
    }

    pub fn history(
        &self,
        viewer: &str,
        conversation: &ConversationRef,
    ) -> Result<(ConversationKey, Vec<Message>)> {
        let key = conversation.key_for(viewer);
        let messages = self.store.list_for_conversation(viewer, conversation)?;
        debug!(key = %key, count = messages.len(), "History loaded");
        Ok((key, messages))
    }

    /// Direct keys are derived from `viewer`, so nobody can listen in on someone else's pair
    pub fn subscribe(
        &self,
        viewer: &str,
        conversation: &ConversationRef,
        sink: Arc<dyn EventSink>,
    ) -> Subscription {
        self.live.subscribe(conversation.key_for(viewer), sink)
    }
}
