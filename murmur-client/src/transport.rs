use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use murmur_server::{ChatError, ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::session::ChatTransport;

const DEFAULT_SERVER_URL: &str = "ws://localhost:9001";
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Internal message type for the write channel
enum WriteMessage {
    Data(String),
    Close,
}

/// Server URL from `MURMUR_SERVER_URL`, or the local default
pub fn server_url_from_env() -> String {
    std::env::var("MURMUR_SERVER_URL").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string())
}

/// WebSocket connection to a Murmur server
pub struct WsChatClient {
    write_tx: mpsc::UnboundedSender<WriteMessage>,
    connected: Arc<AtomicBool>,
}

impl WsChatClient {
    /// Connect and authenticate. Incoming frames arrive on the returned receiver.
    pub async fn connect(
        server_url: &str,
        user_id: &str,
        token: Option<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), ChatError> {
        info!(url = %server_url, "Connecting to Murmur server");
        let (ws_stream, _) = connect_async(server_url)
            .await
            .map_err(|e| ChatError::Transport(format!("connect failed: {}", e)))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let connect_json = serde_json::to_string(&ClientMessage::Connect {
            user_id: user_id.to_string(),
            token,
        })?;
        ws_write
            .send(Message::Text(connect_json.into()))
            .await
            .map_err(|e| ChatError::Transport(format!("failed to send connect: {}", e)))?;

        // Wait for auth response
        let auth = tokio::time::timeout(AUTH_TIMEOUT, async {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => return Some(serde_json::from_str::<ServerMessage>(&text)),
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
            None
        })
        .await
        .map_err(|_| ChatError::Transport("authentication timeout".to_string()))?;

        match auth {
            Some(Ok(ServerMessage::AuthResponse { success: true, message })) => {
                info!("Authenticated with server: {}", message);
            }
            Some(Ok(ServerMessage::AuthResponse { message, .. })) => {
                error!("Authentication failed: {}", message);
                return Err(ChatError::Transport(format!("authentication failed: {}", message)));
            }
            Some(Ok(_)) => return Err(ChatError::Protocol("unexpected response during auth".to_string())),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ChatError::Transport("connection closed during auth".to_string())),
        }

        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WriteMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let connected = Arc::new(AtomicBool::new(true));
        let connected_flag = connected.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Send outgoing messages
                    outgoing = write_rx.recv() => {
                        match outgoing {
                            Some(WriteMessage::Data(data)) => {
                                if ws_write.send(Message::Text(data.into())).await.is_err() {
                                    error!("Failed to send message to server");
                                    break;
                                }
                            }
                            Some(WriteMessage::Close) | None => {
                                info!("Close requested, sending close frame");
                                if let Err(e) = ws_write.send(Message::Close(None)).await {
                                    warn!(error = %e, "Failed to send close frame");
                                }
                                break;
                            }
                        }
                    }
                    // Receive incoming messages
                    incoming = ws_read.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerMessage>(&text) {
                                    Ok(msg) => {
                                        if inbound_tx.send(msg).is_err() {
                                            debug!("Inbound receiver dropped");
                                        }
                                    }
                                    Err(e) => warn!(error = %e, "Unparseable frame from server"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("Server closed connection");
                                break;
                            }
                            Some(Err(e)) => {
                                error!(error = %e, "WebSocket error");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
            connected_flag.store(false, Ordering::Release);
        });

        Ok((Self { write_tx, connected }, inbound_rx))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Gracefully disconnect from the server
    pub fn close(&self) {
        info!("Initiating graceful disconnect");
        let _ = self.write_tx.send(WriteMessage::Close);
    }
}

impl ChatTransport for WsChatClient {
    fn send(&self, frame: ClientMessage) -> Result<(), ChatError> {
        if !self.is_connected() {
            warn!("Cannot send message: not connected to server");
            return Err(ChatError::Transport("not connected to server".to_string()));
        }
        let json = serde_json::to_string(&frame)?;
        let preview: String = json.chars().take(100).collect();
        debug!(preview = %preview, "Sending message to server");
        self.write_tx
            .send(WriteMessage::Data(json))
            .map_err(|_| ChatError::Transport("connection task stopped".to_string()))
    }
}
