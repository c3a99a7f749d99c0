//! Murmur server library
//!
//! Message store, live update channel and WebSocket connection handling,
//! exposed for the binary, the client crate and integration tests.

pub mod blobs;
pub mod config;
mod connection;
pub mod error;
pub mod key;
pub mod live;
pub mod messages;
pub mod models;
mod state;
pub mod store;

pub use connection::{handle_connection, handle_message, Session};
pub use error::{ChatError, Result};
pub use key::{ConversationKey, ConversationRef};
pub use live::{EventSink, LiveChannel, LiveEvent, Subscription};
pub use messages::{ClientMessage, ServerMessage};
pub use models::{Attachment, Message, NewMessage};
pub use state::ServerState;
pub use store::{Deletion, MessageStore};
