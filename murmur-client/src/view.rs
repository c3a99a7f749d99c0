//! Client Conversation View.
//!
//! A single-threaded state machine over one selected conversation. Inputs come
//! from the user and from the server; every input returns the [`Effect`]s a
//! driver must carry out. The view itself never does I/O.

use std::collections::HashSet;

use murmur_server::{ChatError, ConversationKey, ConversationRef, LiveEvent, Message};
use tracing::debug;

use crate::render::{describe, MessageView};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    FetchHistory(ConversationRef),
    Subscribe(ConversationRef),
    Unsubscribe(ConversationRef),
    RequestDelete(String),
    /// User-visible notice, e.g. a rejected command
    Notice(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Loading,
    Ready,
    Error,
}

#[derive(Debug)]
enum ViewState {
    Idle,
    Loading {
        conversation: ConversationRef,
        key: ConversationKey,
        /// Live events that arrived before history
        buffered: Vec<LiveEvent>,
    },
    Ready {
        conversation: ConversationRef,
        key: ConversationKey,
        messages: Vec<Message>,
    },
    Error {
        key: ConversationKey,
        reason: String,
    },
}

pub struct ConversationView {
    viewer: String,
    state: ViewState,
    deleting: HashSet<String>,
}

impl ConversationView {
    pub fn new(viewer: impl Into<String>) -> Self {
        Self {
            viewer: viewer.into(),
            state: ViewState::Idle,
            deleting: HashSet::new(),
        }
    }

    pub fn viewer(&self) -> &str {
        &self.viewer
    }

    pub fn phase(&self) -> Phase {
        match self.state {
            ViewState::Idle => Phase::Idle,
            ViewState::Loading { .. } => Phase::Loading,
            ViewState::Ready { .. } => Phase::Ready,
            ViewState::Error { .. } => Phase::Error,
        }
    }

    pub fn active_key(&self) -> Option<&ConversationKey> {
        match &self.state {
            ViewState::Idle => None,
            ViewState::Loading { key, .. }
            | ViewState::Ready { key, .. }
            | ViewState::Error { key, .. } => Some(key),
        }
    }

    /// Loaded messages, oldest first. Empty unless Ready.
    pub fn messages(&self) -> &[Message] {
        match &self.state {
            ViewState::Ready { messages, .. } => messages,
            _ => &[],
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            ViewState::Error { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn is_deleting(&self, message_id: &str) -> bool {
        self.deleting.contains(message_id)
    }

    pub fn render(&self) -> Vec<MessageView> {
        self.messages()
            .iter()
            .map(|m| {
                let mut view = describe(m, &self.viewer);
                view.deleting = self.is_deleting(&m.id);
                view
            })
            .collect()
    }

    /// Open a conversation. The live subscription goes out before the history
    /// request; anything it delivers is held until history lands.
    pub fn select(&mut self, conversation: ConversationRef) -> Vec<Effect> {
        let key = conversation.key_for(&self.viewer);
        if matches!(
            &self.state,
            ViewState::Loading { key: k, .. } | ViewState::Ready { key: k, .. } if *k == key
        ) {
            return Vec::new();
        }

        let mut effects = self.teardown();
        effects.push(Effect::Subscribe(conversation.clone()));
        effects.push(Effect::FetchHistory(conversation.clone()));
        debug!(key = %key, "Loading conversation");
        self.state = ViewState::Loading {
            conversation,
            key,
            buffered: Vec::new(),
        };
        effects
    }

    pub fn close(&mut self) -> Vec<Effect> {
        let effects = self.teardown();
        self.state = ViewState::Idle;
        effects
    }

    /// Unsubscribe from whatever is active; Error and Idle hold no subscription.
    /// In-flight deletes stay guarded until they resolve.
    fn teardown(&mut self) -> Vec<Effect> {
        match &self.state {
            ViewState::Loading { conversation, .. } | ViewState::Ready { conversation, .. } => {
                vec![Effect::Unsubscribe(conversation.clone())]
            }
            ViewState::Idle | ViewState::Error { .. } => Vec::new(),
        }
    }

    pub fn history_loaded(
        &mut self,
        key: &ConversationKey,
        result: Result<Vec<Message>, ChatError>,
    ) -> Vec<Effect> {
        let (conversation, buffered) = match &mut self.state {
            ViewState::Loading {
                conversation,
                key: active,
                buffered,
            } if active == key => (conversation.clone(), std::mem::take(buffered)),
            _ => {
                debug!(key = %key, "Ignoring stale history");
                return Vec::new();
            }
        };

        match result {
            Ok(mut history) => {
                history.sort_by_key(|m| m.created_at);
                let mut messages = Vec::with_capacity(history.len());
                for message in history {
                    merge(&mut messages, message);
                }
                for event in buffered {
                    if let LiveEvent::Deleted { message_id, .. } = &event {
                        self.deleting.remove(message_id);
                    }
                    apply(&mut messages, event);
                }
                self.state = ViewState::Ready {
                    conversation,
                    key: key.clone(),
                    messages,
                };
                Vec::new()
            }
            Err(e) => {
                let reason = e.to_string();
                self.state = ViewState::Error {
                    key: key.clone(),
                    reason: reason.clone(),
                };
                vec![
                    Effect::Unsubscribe(conversation),
                    Effect::Notice(format!("Failed to load messages: {}", reason)),
                ]
            }
        }
    }

    /// Apply a live event; events for any other conversation are ignored
    pub fn apply_event(&mut self, event: LiveEvent) {
        match &mut self.state {
            ViewState::Loading { key, buffered, .. } if key == event.key() => buffered.push(event),
            ViewState::Ready { key, messages, .. } if key == event.key() => {
                if let LiveEvent::Deleted { message_id, .. } = &event {
                    self.deleting.remove(message_id);
                }
                apply(messages, event);
            }
            _ => debug!(key = %event.key(), "Ignoring event for inactive conversation"),
        }
    }

    /// Echo of our own send; merges like a created event
    pub fn message_sent(&mut self, message: Message) {
        let key = message.conversation_key();
        self.apply_event(LiveEvent::Created { key, message });
    }

    /// Ask to delete one of the viewer's messages. Repeats while the first
    /// request is in flight produce nothing.
    pub fn request_delete(&mut self, message_id: &str) -> Vec<Effect> {
        let Some(message) = self.messages().iter().find(|m| m.id == message_id) else {
            return Vec::new();
        };
        if message.sender_id != self.viewer {
            return vec![Effect::Notice(
                "You can only delete your own messages".to_string(),
            )];
        }
        if !self.deleting.insert(message_id.to_string()) {
            return Vec::new();
        }
        vec![Effect::RequestDelete(message_id.to_string())]
    }

    pub fn delete_resolved(&mut self, message_id: &str, result: Result<(), ChatError>) -> Vec<Effect> {
        self.deleting.remove(message_id);
        match result {
            Ok(()) => {
                if let ViewState::Ready { messages, .. } = &mut self.state {
                    messages.retain(|m| m.id != message_id);
                }
                Vec::new()
            }
            Err(e) => vec![Effect::Notice(format!("Failed to delete message: {}", e))],
        }
    }
}

/// Insert at the ascending-timestamp position unless the id is already present
fn merge(messages: &mut Vec<Message>, message: Message) {
    if messages.iter().any(|m| m.id == message.id) {
        return;
    }
    let at = messages.partition_point(|m| m.created_at <= message.created_at);
    messages.insert(at, message);
}

fn apply(messages: &mut Vec<Message>, event: LiveEvent) {
    match event {
        LiveEvent::Created { message, .. } => merge(messages, message),
        LiveEvent::Deleted { message_id, .. } => messages.retain(|m| m.id != message_id),
    }
}
