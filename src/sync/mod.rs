//! Synchronization module for the shared document.
//!
//! This module implements the core synchronization logic:
//! - Connection registry with per-connection bounded outbound queues
//! - Reference-counted presence tracking
//! - Last-write-wins document state
//! - JSON event protocol
//! - The hub that serializes mutations and routes broadcasts

pub mod document;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod registry;

pub use document::{DocumentSnapshot, DocumentState, LastEditor};
pub use hub::{HubStats, IdentityPolicy, SyncHub, SyncHubConfig};
pub use registry::Outbox;

use thiserror::Error;

use protocol::ErrorCode;

/// Unique identifier for a transport connection
pub type ConnectionId = String;

/// Display name a connection joins under
pub type Identity = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while handling a connection's events
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Username is required")]
    InvalidIdentity,

    #[error("Unauthorized change: {0}")]
    UnauthorizedChange(String),

    #[error("Connection has already joined as {0}")]
    AlreadyJoined(Identity),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Wire code reported to the offending connection
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::InvalidIdentity => ErrorCode::InvalidIdentity,
            SyncError::UnauthorizedChange(_) => ErrorCode::UnauthorizedChange,
            SyncError::AlreadyJoined(_) => ErrorCode::AlreadyJoined,
            SyncError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            SyncError::ConnectionNotFound(_) | SyncError::Internal(_) => ErrorCode::InternalFault,
        }
    }
}

/// Validate a client-supplied display name, returning it trimmed
pub fn validate_identity(name: &str) -> SyncResult<Identity> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidIdentity);
    }
    Ok(trimmed.to_string())
}
