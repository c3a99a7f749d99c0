//! Drives a [`ConversationView`] against a transport.

use std::collections::VecDeque;

use murmur_server::{
    ChatError, ClientMessage, ConversationRef, LiveEvent, NewMessage, ServerMessage,
};
use tracing::{debug, warn};

use crate::view::{ConversationView, Effect};

/// Outbound half of a connection to the server
pub trait ChatTransport {
    fn send(&self, frame: ClientMessage) -> Result<(), ChatError>;
}

pub struct ChatSession<T: ChatTransport> {
    view: ConversationView,
    transport: T,
    notices: Vec<String>,
}

impl<T: ChatTransport> ChatSession<T> {
    pub fn new(viewer: impl Into<String>, transport: T) -> Self {
        Self {
            view: ConversationView::new(viewer),
            transport,
            notices: Vec::new(),
        }
    }

    pub fn view(&self) -> &ConversationView {
        &self.view
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Drain notices collected since the last call
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    pub fn open(&mut self, conversation: ConversationRef) {
        let effects = self.view.select(conversation);
        self.run(effects);
    }

    pub fn close(&mut self) {
        let effects = self.view.close();
        self.run(effects);
    }

    pub fn delete(&mut self, message_id: &str) {
        let effects = self.view.request_delete(message_id);
        self.run(effects);
    }

    pub fn send(&mut self, message: NewMessage) -> Result<(), ChatError> {
        self.transport
            .send(ClientMessage::Send { message })
            .inspect_err(|e| self.notices.push(format!("Failed to send message: {}", e)))
    }

    /// Feed one frame from the server into the view
    pub fn handle_server_message(&mut self, msg: ServerMessage) {
        let effects = match msg {
            ServerMessage::History { key, messages } => self.view.history_loaded(&key, Ok(messages)),
            ServerMessage::HistoryFailed { key, code, message } => self
                .view
                .history_loaded(&key, Err(ChatError::from_wire(&code, message))),
            ServerMessage::MessageCreated { key, message } => {
                self.view.apply_event(LiveEvent::Created { key, message });
                Vec::new()
            }
            ServerMessage::MessageDeleted { key, message_id } => {
                self.view.apply_event(LiveEvent::Deleted { key, message_id });
                Vec::new()
            }
            ServerMessage::Sent { message } => {
                self.view.message_sent(message);
                Vec::new()
            }
            ServerMessage::Deleted { message_id } => self.view.delete_resolved(&message_id, Ok(())),
            ServerMessage::DeleteFailed {
                message_id,
                code,
                message,
            } => self
                .view
                .delete_resolved(&message_id, Err(ChatError::from_wire(&code, message))),
            ServerMessage::Error { code, message } => {
                vec![Effect::Notice(ChatError::from_wire(&code, message).to_string())]
            }
            ServerMessage::AuthResponse { success, message } => {
                if success {
                    Vec::new()
                } else {
                    vec![Effect::Notice(format!("Authentication failed: {}", message))]
                }
            }
            ServerMessage::Subscribed { key } | ServerMessage::Unsubscribed { key } => {
                debug!(key = %key, "Subscription acknowledged");
                Vec::new()
            }
        };
        self.run(effects);
    }

    fn run(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Notice(text) => self.notices.push(text),
                Effect::Subscribe(conversation) => {
                    if let Err(e) = self.transport.send(ClientMessage::Subscribe { conversation }) {
                        warn!(error = %e, "Subscribe not sent");
                    }
                }
                Effect::Unsubscribe(conversation) => {
                    if let Err(e) = self.transport.send(ClientMessage::Unsubscribe { conversation }) {
                        warn!(error = %e, "Unsubscribe not sent");
                    }
                }
                Effect::FetchHistory(conversation) => {
                    let key = conversation.key_for(self.view.viewer());
                    if let Err(e) = self.transport.send(ClientMessage::History { conversation }) {
                        queue.extend(self.view.history_loaded(&key, Err(e)));
                    }
                }
                Effect::RequestDelete(message_id) => {
                    let frame = ClientMessage::Delete {
                        message_id: message_id.clone(),
                    };
                    if let Err(e) = self.transport.send(frame) {
                        queue.extend(self.view.delete_resolved(&message_id, Err(e)));
                    }
                }
            }
        }
    }
}
