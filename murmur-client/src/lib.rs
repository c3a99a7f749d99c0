//! Murmur client library
//!
//! The conversation view reconciles history with live events; the session
//! carries out what the view asks for over a [`ChatTransport`].

pub mod render;
pub mod session;
pub mod transport;
pub mod view;

pub use render::{describe, MessageView, Side};
pub use session::{ChatSession, ChatTransport};
pub use transport::{server_url_from_env, WsChatClient};
pub use view::{ConversationView, Effect, Phase};
