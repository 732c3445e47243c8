//! Registry of live connections and the identity bound to each.
//!
//! Each connection owns a bounded outbound queue drained by its transport
//! writer task. Sends never wait: a full queue is reported back to the caller
//! so the hub can evict the slow consumer.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use super::protocol::ServerMessage;
use super::{validate_identity, ConnectionId, Identity, SyncError, SyncResult};

/// Sending half of a connection's outbound queue
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerMessage>,
}

/// Outcome of a single non-blocking send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Queue full; the recipient is not keeping up
    Overflowed,
    /// Writer side already gone
    Closed,
}

impl Outbox {
    /// Create a bounded outbound queue
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a message without waiting
    pub fn deliver(&self, msg: ServerMessage) -> Delivery {
        match self.tx.try_send(msg) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Overflowed,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Which connections a broadcast goes to
#[derive(Debug, Clone, Copy)]
pub enum Recipients<'a> {
    /// Every registered connection, joined or not
    All,
    /// Joined connections other than the given one
    JoinedExcept(&'a str),
}

/// A single live connection
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    /// Bound at join, at most once
    pub identity: Option<Identity>,
    pub connected_at: Instant,
    outbox: Outbox,
}

impl Connection {
    fn new(id: impl Into<String>, outbox: Outbox) -> Self {
        Self {
            id: id.into(),
            identity: None,
            connected_at: Instant::now(),
            outbox,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.identity.is_some()
    }
}

/// Live connections keyed by connection id
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection with no identity yet
    pub fn register(&self, id: &str, outbox: Outbox) {
        self.connections
            .insert(id.to_string(), Connection::new(id, outbox));
        debug!("Connection registered: {}", id);
    }

    /// Bind a display name to a connection. Returns the bound (trimmed) name.
    pub fn bind_identity(&self, id: &str, name: &str) -> SyncResult<Identity> {
        let identity = validate_identity(name)?;
        let mut conn = self
            .connections
            .get_mut(id)
            .ok_or_else(|| SyncError::ConnectionNotFound(id.to_string()))?;

        if let Some(existing) = &conn.identity {
            return Err(SyncError::AlreadyJoined(existing.clone()));
        }
        conn.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Remove a connection. Idempotent: unknown ids return None.
    pub fn unregister(&self, id: &str) -> Option<Connection> {
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    /// Identity bound to a connection, if it has joined
    pub fn identity(&self, id: &str) -> Option<Identity> {
        self.connections.get(id).and_then(|c| c.identity.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    /// All currently bound identities
    pub fn list_identities(&self) -> BTreeSet<Identity> {
        self.connections
            .iter()
            .filter_map(|entry| entry.identity.clone())
            .collect()
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of connections that have joined
    pub fn joined_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_joined()).count()
    }

    /// Send to a single connection
    pub fn send_to(&self, id: &str, msg: ServerMessage) -> Delivery {
        match self.connections.get(id) {
            Some(conn) => conn.outbox.deliver(msg),
            None => Delivery::Closed,
        }
    }

    /// Send to every matching connection. Returns the ids whose queues overflowed.
    pub fn broadcast(&self, recipients: Recipients<'_>, msg: &ServerMessage) -> Vec<ConnectionId> {
        let mut overflowed = Vec::new();
        for entry in self.connections.iter() {
            let included = match recipients {
                Recipients::All => true,
                Recipients::JoinedExcept(origin) => entry.is_joined() && entry.id != origin,
            };
            if included && entry.outbox.deliver(msg.clone()) == Delivery::Overflowed {
                overflowed.push(entry.id.clone());
            }
        }
        overflowed
    }
}
