//! JSON WebSocket protocol for the shared document.
//!
//! Every text frame carries one named event:
//! `{"event": "<name>", "data": <payload>}`. Event names are kebab-case.

use serde::{Deserialize, Serialize};

use super::document::{DocumentSnapshot, LastEditor};
use super::Identity;

/// Default largest inbound frame (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),
}

/// Events sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Bind a display name to this connection
    Join { identity: String },

    /// Replace the document content
    ContentChange {
        content: String,
        /// Identity the client claims for this change
        #[serde(default)]
        identity: String,
    },

    /// Keepalive
    Ping { timestamp: u64 },
}

/// Events sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Current document, sent to a connection right after it joins
    InitialState(DocumentSnapshot),

    /// Document replaced by another participant
    ContentUpdate {
        content: String,
        last_editor: LastEditor,
    },

    /// Full list of present identities
    PresenceUpdate { identities: Vec<Identity> },

    /// Connection-scoped, non-fatal failure
    ErrorNotice { code: ErrorCode, message: String },

    /// Keepalive response
    Pong { timestamp: u64, server_time: i64 },
}

/// Error codes for error notices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidIdentity,
    UnauthorizedChange,
    AlreadyJoined,
    InvalidMessage,
    InternalFault,
}

/// Protocol codec for encoding/decoding events.
///
/// Only inbound frames are size-checked; outbound events carry attribution on
/// top of accepted content and must always be encodable.
pub struct SyncProtocol;

impl SyncProtocol {
    /// Encode a server event to a text frame
    pub fn encode_server(msg: &ServerMessage) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }

    /// Encode a client event to a text frame
    pub fn encode_client(msg: &ClientMessage) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }

    /// Decode a client event from a text frame no larger than `max_size`
    pub fn decode_client(data: &str, max_size: usize) -> Result<ClientMessage, ProtocolError> {
        if data.len() > max_size {
            return Err(ProtocolError::MessageTooLarge(data.len(), max_size));
        }
        Ok(serde_json::from_str(data)?)
    }

    /// Decode a server event from a text frame
    pub fn decode_server(data: &str) -> Result<ServerMessage, ProtocolError> {
        Ok(serde_json::from_str(data)?)
    }

    /// Create an error notice
    pub fn error_notice(code: ErrorCode, message: impl Into<String>) -> ServerMessage {
        ServerMessage::ErrorNotice {
            code,
            message: message.into(),
        }
    }
}
