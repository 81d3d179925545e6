//! Message protocol definitions
//!
//! Inbound frames are decoded into a typed `ClientCommand`; outbound
//! messages are a Serde tagged enum batched into a `ServerMessages`
//! envelope, one envelope per WebSocket frame.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Raw inbound frame as sent by the client
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: String,
    #[serde(default, rename = "additionalData")]
    additional_data: Option<SwitchExtras>,
}

/// Optional fields accepted on the switch commands
#[derive(Debug, Default, Deserialize)]
struct SwitchExtras {
    #[serde(default)]
    message: Option<String>,
}

/// Client → Server command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Send a chat message to the current channel
    SendMessage { text: String },
    /// Join (creating if needed) a named channel, optionally posting a message on arrival
    SwitchMultiChannel { name: String, message: Option<String> },
    /// Join the direct channel with a peer, optionally posting a message on arrival
    SwitchDirectChannel { peer: String, message: Option<String> },
    /// Application-level keep-alive
    Ping,
    /// Anything else
    Unknown { kind: String },
}

impl ClientCommand {
    /// Decode a text frame into a command
    ///
    /// Fails only when the frame is not a JSON object with a string `type`.
    pub fn parse(text: &str) -> Result<Self, ChatError> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        let message = frame.additional_data.and_then(|extras| extras.message);

        let command = match frame.kind.as_str() {
            "sendMessage" => ClientCommand::SendMessage { text: frame.data },
            "switchMultiChannel" => ClientCommand::SwitchMultiChannel {
                name: frame.data,
                message,
            },
            "switchDirectChannel" => ClientCommand::SwitchDirectChannel {
                peer: frame.data,
                message,
            },
            "ping" => ClientCommand::Ping,
            _ => ClientCommand::Unknown { kind: frame.kind },
        };
        Ok(command)
    }
}

/// Server → Client message
///
/// Uses tagged enum with camelCase discriminants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Informational or error text from the server
    ServerMessage { message: String, timestamp: i64 },
    /// The client joined a channel (`#name` or `@peer`)
    SwitchedChannel { channel: String, timestamp: i64 },
    /// Chat message from a user
    UserMessage {
        sender: String,
        message: String,
        timestamp: i64,
    },
}

impl ServerMessage {
    pub fn server(message: impl Into<String>) -> Self {
        ServerMessage::ServerMessage {
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    pub fn switched_channel(channel: impl Into<String>) -> Self {
        ServerMessage::SwitchedChannel {
            channel: channel.into(),
            timestamp: now_millis(),
        }
    }

    pub fn user(sender: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::UserMessage {
            sender: sender.into(),
            message: message.into(),
            timestamp: now_millis(),
        }
    }
}

/// Convert a recoverable error into a notification for the client
impl From<&ChatError> for ServerMessage {
    fn from(err: &ChatError) -> Self {
        ServerMessage::server(err.to_string())
    }
}

/// Outbound envelope: everything drained from the queue in one wake-up
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerMessages {
    pub messages: Vec<ServerMessage>,
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
