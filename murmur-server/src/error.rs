//! Error taxonomy shared by the store, the live channel and the client view.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Missing routing identity, empty content or out-of-bounds fields
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation on a message id that does not exist
    #[error("message not found: {0}")]
    NotFound(String),

    /// Requester is not allowed to touch this message
    #[error("user {requester} may not modify message {message_id}")]
    Forbidden {
        message_id: String,
        requester: String,
    },

    /// Live channel or socket unavailable. Never fatal.
    #[error("transport unavailable: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("blob storage error: {0}")]
    Blob(#[from] std::io::Error),

    /// Malformed or unexpected frame on the wire
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Rejection relayed from the server under a code this side has no variant for
    #[error("rejected ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl ChatError {
    /// Stable code sent to clients alongside the human readable message
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::NotFound(_) => "not_found",
            ChatError::Forbidden { .. } => "forbidden",
            ChatError::Transport(_) => "transport",
            ChatError::Storage(_) => "storage",
            ChatError::Blob(_) => "blob",
            ChatError::Protocol(_) => "protocol",
            ChatError::Rejected { .. } => "rejected",
        }
    }

    /// Rebuild an error from a code and message received over the wire.
    ///
    /// `forbidden` comes back as [`ChatError::Rejected`] on purpose: the wire
    /// carries no message id or requester to fill a `Forbidden`. Use
    /// [`ChatError::is_forbidden`] to test for it.
    pub fn from_wire(code: &str, message: String) -> Self {
        match code {
            "validation" => ChatError::Validation(message),
            "not_found" => ChatError::NotFound(message),
            "transport" => ChatError::Transport(message),
            "protocol" => ChatError::Protocol(message),
            _ => ChatError::Rejected {
                code: code.to_string(),
                message,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ChatError::NotFound(_))
    }

    pub fn is_forbidden(&self) -> bool {
        match self {
            ChatError::Forbidden { .. } => true,
            ChatError::Rejected { code, .. } => code == "forbidden",
            _ => false,
        }
    }
}

impl From<garde::Report> for ChatError {
    fn from(report: garde::Report) -> Self {
        ChatError::Validation(report.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ChatError::Validation("x".into()).code(), "validation");
        assert_eq!(ChatError::NotFound("m1".into()).code(), "not_found");
        assert_eq!(
            ChatError::Forbidden {
                message_id: "m1".into(),
                requester: "bob".into()
            }
            .code(),
            "forbidden"
        );
        assert_eq!(ChatError::Transport("gone".into()).code(), "transport");
    }

    #[test]
    fn test_from_wire_maps_known_codes() {
        assert!(ChatError::from_wire("not_found", "m1".into()).is_not_found());
        assert!(ChatError::from_wire("forbidden", "nope".into()).is_forbidden());
        assert!(matches!(
            ChatError::from_wire("storage", "disk full".into()),
            ChatError::Rejected { .. }
        ));
    }

    #[test]
    fn test_forbidden_from_wire_keeps_message() {
        let err = ChatError::from_wire("forbidden", "not your message".into());
        assert!(err.is_forbidden());
        match err {
            ChatError::Rejected { code, message } => {
                assert_eq!(code, "forbidden");
                assert_eq!(message, "not your message");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
