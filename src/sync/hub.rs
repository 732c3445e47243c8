//! SyncHub: the sole mutator of shared state and the fan-out router.
//!
//! Every mutating operation takes the state lock, updates the registry,
//! presence and document, and queues the resulting broadcasts before the lock
//! is released, so all connections observe changes in the same order.
//! Delivery is a non-blocking push onto each connection's bounded queue; a
//! connection whose queue is full is disconnected.

use parking_lot::Mutex;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::document::{DocumentSnapshot, DocumentState};
use super::presence::PresenceTracker;
use super::protocol::{ClientMessage, ErrorCode, ServerMessage, SyncProtocol, MAX_MESSAGE_SIZE};
use super::registry::{ConnectionRegistry, Delivery, Outbox, Recipients};
use super::{validate_identity, ConnectionId, Identity, SyncError, SyncResult};

/// How the identity declared on a content change is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityPolicy {
    /// Declared identity must match the one bound at join
    #[default]
    Strict,
    /// Declared identity is used for attribution as-is
    Trust,
}

impl FromStr for IdentityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(IdentityPolicy::Strict),
            "trust" => Ok(IdentityPolicy::Trust),
            other => Err(format!("unknown identity policy: {}", other)),
        }
    }
}

/// Configuration for the SyncHub
#[derive(Debug, Clone)]
pub struct SyncHubConfig {
    pub identity_policy: IdentityPolicy,
    /// Largest inbound frame accepted by `handle_frame`
    pub max_message_size: usize,
}

impl Default for SyncHubConfig {
    fn default() -> Self {
        Self {
            identity_policy: IdentityPolicy::default(),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

thread_local! {
    static CONTAINING_PANIC: Cell<bool> = Cell::new(false);
}

/// True while the current thread runs an event handler whose panics the hub
/// catches and logs itself.
pub fn panic_is_contained() -> bool {
    CONTAINING_PANIC.with(Cell::get)
}

/// State guarded by the hub's single lock
#[derive(Debug, Default)]
struct SharedState {
    document: DocumentState,
    presence: PresenceTracker,
}

/// The synchronization hub
pub struct SyncHub {
    config: SyncHubConfig,
    registry: ConnectionRegistry,
    state: Mutex<SharedState>,
    started_at: Instant,
}

impl SyncHub {
    pub fn new(config: SyncHubConfig) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            state: Mutex::new(SharedState::default()),
            started_at: Instant::now(),
        }
    }

    /// Register a freshly accepted connection
    pub fn connect(&self, connection_id: &str, outbox: Outbox) {
        self.registry.register(connection_id, outbox);
        info!("Connection opened: {}", connection_id);
    }

    /// Decode and handle one text frame
    pub fn handle_frame(&self, connection_id: &str, text: &str) {
        match SyncProtocol::decode_client(text, self.config.max_message_size) {
            Ok(msg) => self.handle_message(connection_id, msg),
            Err(e) => {
                warn!("Failed to decode message from {}: {}", connection_id, e);
                self.notify(connection_id, &SyncError::InvalidMessage(e.to_string()));
            }
        }
    }

    /// Reject a frame the transport cannot interpret
    pub fn reject_frame(&self, connection_id: &str, reason: &str) {
        self.notify(connection_id, &SyncError::InvalidMessage(reason.to_string()));
    }

    /// Handle one decoded event. Failures are reported to the sender only.
    pub fn handle_message(&self, connection_id: &str, msg: ClientMessage) {
        self.guarded(connection_id, || match msg {
            ClientMessage::Join { identity } => self.join(connection_id, &identity),
            ClientMessage::ContentChange { content, identity } => {
                self.change_content(connection_id, content, &identity)
            }
            ClientMessage::Ping { timestamp } => {
                self.unicast(
                    connection_id,
                    ServerMessage::Pong {
                        timestamp,
                        server_time: chrono::Utc::now().timestamp_millis(),
                    },
                );
                Ok(())
            }
        });
    }

    /// Run an event handler, turning errors and panics into an error notice
    fn guarded<F>(&self, connection_id: &str, handler: F)
    where
        F: FnOnce() -> SyncResult<()>,
    {
        CONTAINING_PANIC.with(|flag| flag.set(true));
        let outcome = panic::catch_unwind(AssertUnwindSafe(handler));
        CONTAINING_PANIC.with(|flag| flag.set(false));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Rejected event from {}: {}", connection_id, e);
                self.notify(connection_id, &e);
            }
            Err(payload) => {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Internal fault handling event from {}: {}", connection_id, detail);
                self.notify(connection_id, &SyncError::Internal(detail));
            }
        }
    }

    fn join(&self, connection_id: &str, name: &str) -> SyncResult<()> {
        let overflowed = {
            let mut state = self.state.lock();
            let identity = self.registry.bind_identity(connection_id, name)?;
            state.presence.add(&identity);

            let mut overflowed = Vec::new();
            let initial = ServerMessage::InitialState(state.document.snapshot());
            if self.registry.send_to(connection_id, initial) == Delivery::Overflowed {
                overflowed.push(connection_id.to_string());
            }
            overflowed.extend(self.registry.broadcast(
                Recipients::All,
                &ServerMessage::PresenceUpdate {
                    identities: state.presence.list(),
                },
            ));

            info!(
                "User joined: {} ({}), total users: {}",
                identity,
                connection_id,
                state.presence.len()
            );
            overflowed
        };

        self.evict(overflowed);
        Ok(())
    }

    fn change_content(&self, connection_id: &str, content: String, declared: &str) -> SyncResult<()> {
        let overflowed = {
            let mut state = self.state.lock();
            let bound = self.registry.identity(connection_id).ok_or_else(|| {
                SyncError::UnauthorizedChange("join before editing".to_string())
            })?;
            let declared = validate_identity(declared)?;

            let editor = match self.config.identity_policy {
                IdentityPolicy::Strict if declared != bound => {
                    return Err(SyncError::UnauthorizedChange(format!(
                        "joined as {} but change claims {}",
                        bound, declared
                    )));
                }
                IdentityPolicy::Strict => bound,
                IdentityPolicy::Trust => declared,
            };

            let snapshot = state.document.apply(&editor, content)?;
            let last_editor = snapshot
                .last_editor
                .ok_or_else(|| SyncError::Internal("change recorded without editor".to_string()))?;

            debug!(
                "{} made a change (revision {})",
                editor,
                state.document.revision()
            );

            self.registry.broadcast(
                Recipients::JoinedExcept(connection_id),
                &ServerMessage::ContentUpdate {
                    content: snapshot.content,
                    last_editor,
                },
            )
        };

        self.evict(overflowed);
        Ok(())
    }

    /// Tear down a connection. Safe to call more than once.
    pub fn disconnect(&self, connection_id: &str) {
        let overflowed = self.remove_connection(connection_id);
        self.evict(overflowed);
    }

    fn remove_connection(&self, connection_id: &str) -> Vec<ConnectionId> {
        let mut state = self.state.lock();
        let Some(conn) = self.registry.unregister(connection_id) else {
            return Vec::new();
        };

        let session = conn.connected_at.elapsed();
        match conn.identity {
            Some(identity) => {
                state.presence.remove(&identity);
                info!(
                    "User disconnected: {} ({}) after {:?}, total users: {}",
                    identity,
                    connection_id,
                    session,
                    state.presence.len()
                );
                self.registry.broadcast(
                    Recipients::All,
                    &ServerMessage::PresenceUpdate {
                        identities: state.presence.list(),
                    },
                )
            }
            None => {
                info!("Unknown user disconnected: {}", connection_id);
                Vec::new()
            }
        }
    }

    /// Disconnect consumers whose queues overflowed, including any that
    /// overflow on the resulting presence broadcasts.
    fn evict(&self, mut pending: Vec<ConnectionId>) {
        while let Some(connection_id) = pending.pop() {
            if self.registry.contains(&connection_id) {
                warn!("Outbound queue full, disconnecting {}", connection_id);
                pending.extend(self.remove_connection(&connection_id));
            }
        }
    }

    fn unicast(&self, connection_id: &str, msg: ServerMessage) {
        if self.registry.send_to(connection_id, msg) == Delivery::Overflowed {
            self.evict(vec![connection_id.to_string()]);
        }
    }

    fn notify(&self, connection_id: &str, err: &SyncError) {
        self.unicast(connection_id, SyncProtocol::error_notice(err.code(), err.to_string()));
    }

    /// Current document and attribution
    pub fn snapshot(&self) -> DocumentSnapshot {
        self.state.lock().document.snapshot()
    }

    /// Present identities in sorted order
    pub fn presence(&self) -> Vec<Identity> {
        self.state.lock().presence.list()
    }

    pub fn stats(&self) -> HubStats {
        let state = self.state.lock();
        HubStats {
            connections: self.registry.len(),
            joined_connections: self.registry.joined_count(),
            participants: state.presence.len(),
            revision: state.document.revision(),
            content_bytes: state.document.len(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for SyncHub {
    fn default() -> Self {
        Self::new(SyncHubConfig::default())
    }
}

/// Hub statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub joined_connections: usize,
    pub participants: usize,
    pub revision: u64,
    pub content_bytes: usize,
    pub uptime_seconds: u64,
}
