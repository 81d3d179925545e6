//! Error types for the chat relay
//!
//! Defines relay-level errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Relay-level errors
///
/// Covers both fatal errors (connection termination) and
/// recoverable errors (reported to the client as a server message).
#[derive(Debug, Error)]
pub enum ChatError {
    /// Channel name failed validation
    #[error("{0}")]
    InvalidChannelName(String),

    /// Username failed validation or is already taken
    #[error("{0}")]
    InvalidUsername(String),

    /// Direct channel target is not connected
    #[error("User {0} does not exist")]
    UserNotFound(String),

    /// Inbound command type is not recognized
    #[error("Unknown message type: {0}")]
    UnknownCommand(String),

    /// A handle outside the allowed pair tried to join a direct channel
    #[error("You are not a participant of this channel")]
    NotParticipant,

    /// Direct channel requested with oneself
    #[error("You cannot open a direct channel with yourself")]
    DirectToSelf,

    /// The channel actor has stopped
    #[error("This channel has been closed")]
    ChannelClosed,

    /// Outbound queue was full at delivery time (fatal for that subscriber)
    #[error("Outbound queue is full")]
    SlowConsumer,

    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
