//! Error taxonomy for the real-time chat client

use std::fmt;

/// Failures inside the chat subsystem.
///
/// None of these escape `connect`/`join`/`leave`: the connection driver logs
/// them and turns them into state transitions or `ConnectionEvent`s.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Transport could not be opened or failed mid-session. Retryable.
    #[error("connection failed: {0}")]
    Connection(String),

    /// No socket.io connect ack within the handshake bound.
    #[error("handshake timed out after {0}s")]
    HandshakeTimeout(u64),

    /// Server answered the namespace connect with a connect_error packet.
    #[error("server rejected connection: {0}")]
    Rejected(String),

    /// Malformed frame or unexpected packet during the handshake.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// REST write path failure.
    #[error("api request failed: {0}")]
    Api(String),
}

impl ChatError {
    /// Whether the caller may retry with an explicit `connect`.
    pub fn retryable(&self) -> bool {
        !matches!(self, ChatError::Protocol(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Connection(e.to_string())
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;

/// Expected steady-state drops. Never surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    /// Message id already delivered for this room.
    DuplicateDelivery,
    /// Event for a room that is not joined.
    UnknownRoomEvent,
    /// Join attempted with no live connection.
    StaleJoin,
}

impl fmt::Display for Ignored {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Ignored::DuplicateDelivery => "duplicate_delivery_ignored",
            Ignored::UnknownRoomEvent => "unknown_room_event_ignored",
            Ignored::StaleJoin => "stale_join_ignored",
        };
        f.write_str(tag)
    }
}
