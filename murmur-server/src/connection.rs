use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, Result};
use crate::key::ConversationKey;
use crate::live::{EventSink, LiveEvent, Subscription};
use crate::messages::{ClientMessage, ServerMessage};
use crate::models::MAX_ID_LENGTH;
use crate::state::ServerState;

/// Live channel sink writing serialized frames to a connection's outbound queue
struct ConnectionSink {
    tx: mpsc::UnboundedSender<String>,
}

impl EventSink for ConnectionSink {
    fn deliver(&self, event: &LiveEvent) -> Result<()> {
        let json = serde_json::to_string(&ServerMessage::from(event.clone()))?;
        self.tx
            .send(json)
            .map_err(|_| ChatError::Transport("connection closed".to_string()))
    }
}

/// Per-connection state: who is on the other end and what they listen to
pub struct Session {
    user_id: String,
    outbound: mpsc::UnboundedSender<String>,
    subscriptions: HashMap<ConversationKey, Subscription>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            user_id: user_id.into(),
            outbound,
            subscriptions: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_subscribed(&self, key: &ConversationKey) -> bool {
        self.subscriptions.contains_key(key)
    }

    fn reply(&self, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => {
                if self.outbound.send(json).is_err() {
                    debug!(user = %self.user_id, "Reply dropped, connection closing");
                }
            }
            Err(e) => error!(user = %self.user_id, error = %e, "Failed to serialize reply"),
        }
    }

    /// Tear down every subscription held by this connection
    pub fn close(&mut self) {
        for (_, subscription) in self.subscriptions.drain() {
            subscription.unsubscribe();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle a single WebSocket connection
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Wait for Connect message to authenticate
    let user_id = match wait_for_connect(&mut ws_receiver, &state).await {
        Ok(id) => id,
        Err(reason) => {
            warn!("Connection rejected: {}", reason);
            let refusal = ServerMessage::AuthResponse {
                success: false,
                message: reason.to_string(),
            };
            if let Ok(json) = serde_json::to_string(&refusal) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    info!("User connected: {}", user_id);

    // Create channel for sending messages to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut session = Session::new(user_id.clone(), tx);

    session.reply(&ServerMessage::AuthResponse {
        success: true,
        message: "Connected to server".to_string(),
    });

    // Spawn task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            res = ws_receiver.next() => {
                match res {
                    Some(Ok(Message::Text(text))) => {
                        blocking(|| handle_message(&text, &mut session, &state));
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("User {} sent close frame", user_id);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error for user {}: {}", user_id, e);
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended for user {}", user_id);
                        break;
                    }
                    _ => {}
                }
            }
            _ = &mut send_task => {
                info!("Send task finished for user {} (likely connection lost)", user_id);
                break;
            }
        }
    }

    // Cleanup
    session.close();
    send_task.abort();
    info!("User disconnected: {}", user_id);
}

/// Run store and blob work in place, telling a multi-threaded runtime to move
/// other tasks off this worker. Frames on one connection keep their order.
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// Wait for the Connect message from a new connection
async fn wait_for_connect(
    receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
    state: &ServerState,
) -> std::result::Result<String, &'static str> {
    let attempt = async {
        while let Some(result) = receiver.next().await {
            let text = match result {
                Ok(Message::Text(text)) => text,
                Ok(_) => continue,
                Err(_) => return Err("connection error before authentication"),
            };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Connect { user_id, token }) => {
                    let user_id = user_id.trim().to_string();
                    if user_id.is_empty() || user_id.len() > MAX_ID_LENGTH {
                        return Err("invalid user id");
                    }
                    if !state.authorize(token.as_deref()) {
                        warn!("Authentication failed for {}: bad or missing token", user_id);
                        return Err("invalid access token");
                    }
                    return Ok(user_id);
                }
                Ok(_) => return Err("expected connect message"),
                Err(e) => {
                    warn!("Failed to parse Connect message: {}", e);
                }
            }
        }
        Err("connection closed before authentication")
    };

    match tokio::time::timeout(state.auth_timeout(), attempt).await {
        Ok(result) => result,
        Err(_) => Err("authentication timeout"),
    }
}

/// Handle an incoming frame from an authenticated connection
pub fn handle_message(text: &str, session: &mut Session, state: &ServerState) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("Failed to parse message from {}: {}", session.user_id, e);
            session.reply(&ServerMessage::error(&ChatError::from(e)));
            return;
        }
    };

    // Every operation runs as the authenticated identity, never one named in the frame
    let user_id = session.user_id.clone();

    match msg {
        ClientMessage::Connect { .. } => {
            debug!("Ignoring repeated connect from {}", user_id);
        }
        ClientMessage::History { conversation } => {
            let reply = match state.history(&user_id, &conversation) {
                Ok((key, messages)) => ServerMessage::History { key, messages },
                Err(e) => {
                    warn!("History for {} failed: {}", user_id, e);
                    ServerMessage::HistoryFailed {
                        key: conversation.key_for(&user_id),
                        code: e.code().to_string(),
                        message: e.to_string(),
                    }
                }
            };
            session.reply(&reply);
        }
        ClientMessage::Subscribe { conversation } => {
            let key = conversation.key_for(&user_id);
            if !session.is_subscribed(&key) {
                let sink = Arc::new(ConnectionSink {
                    tx: session.outbound.clone(),
                });
                let subscription = state.subscribe(&user_id, &conversation, sink);
                session.subscriptions.insert(key.clone(), subscription);
            }
            session.reply(&ServerMessage::Subscribed { key });
        }
        ClientMessage::Unsubscribe { conversation } => {
            let key = conversation.key_for(&user_id);
            if let Some(subscription) = session.subscriptions.remove(&key) {
                subscription.unsubscribe();
            }
            session.reply(&ServerMessage::Unsubscribed { key });
        }
        ClientMessage::Send { message } => {
            let reply = match state.send_message(&user_id, message) {
                Ok(message) => ServerMessage::Sent { message },
                Err(e) => {
                    warn!("Send from {} rejected: {}", user_id, e);
                    ServerMessage::error(&e)
                }
            };
            session.reply(&reply);
        }
        ClientMessage::Delete { message_id } => {
            let reply = match state.delete_message(&message_id, &user_id) {
                Ok(deletion) => ServerMessage::Deleted {
                    message_id: deletion.message_id,
                },
                Err(e) => {
                    warn!("Delete of {} by {} rejected: {}", message_id, user_id, e);
                    ServerMessage::DeleteFailed {
                        message_id,
                        code: e.code().to_string(),
                        message: e.to_string(),
                    }
                }
            };
            session.reply(&reply);
        }
    }
}
