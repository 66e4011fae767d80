use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::ServerEvent;

pub type ConnectionId = Uuid;

/// What the transport task of a connection should do next
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<ServerEvent>),
    Ping,
    Close,
}

/// Who is on the other end of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRole {
    /// Connected but has not sent a heartbeat yet (admin pages stay here)
    Unidentified,
    Display(String),
}

impl ClientRole {
    pub fn is_display(&self) -> bool {
        matches!(self, ClientRole::Display(_))
    }

    pub fn display_id(&self) -> Option<&str> {
        match self {
            ClientRole::Display(id) => Some(id),
            ClientRole::Unidentified => None,
        }
    }
}

struct ClientHandle {
    sender: mpsc::UnboundedSender<Outbound>,
    role: ClientRole,
    alive: bool,
}

/// Fan-out point for every event that reaches connected clients.
///
/// Delivery is best-effort: a client whose channel is gone simply misses the
/// event and resynchronizes from the `init` snapshot on its next connect.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    connections: Arc<DashMap<ConnectionId, ClientHandle>>,
}

impl fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("connection_count", &self.connections.len())
            .finish()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its id
    pub fn register(&self, sender: mpsc::UnboundedSender<Outbound>) -> ConnectionId {
        let id = Uuid::new_v4();
        self.register_with_id(id, sender);
        id
    }

    pub fn register_with_id(&self, id: ConnectionId, sender: mpsc::UnboundedSender<Outbound>) {
        self.connections.insert(
            id,
            ClientHandle {
                sender,
                role: ClientRole::Unidentified,
                alive: true,
            },
        );
        debug!("Connection {} registered ({} total)", id, self.connections.len());
    }

    /// Drop a connection, returning the role it had
    pub fn unregister(&self, id: ConnectionId) -> Option<ClientRole> {
        self.connections.remove(&id).map(|(_, handle)| handle.role)
    }

    /// Attach a display identity to a connection; returns true if it changed
    pub fn identify(&self, id: ConnectionId, display_id: &str) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut handle) => {
                let role = ClientRole::Display(display_id.to_string());
                if handle.role == role {
                    false
                } else {
                    info!("Connection {} identified as display {}", id, display_id);
                    handle.role = role;
                    true
                }
            }
            None => false,
        }
    }

    pub fn role(&self, id: ConnectionId) -> Option<ClientRole> {
        self.connections.get(&id).map(|h| h.role.clone())
    }

    /// Deliver an event to a single connection
    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        self.connections
            .get(&id)
            .map(|h| h.sender.send(Outbound::Event(Arc::new(event))).is_ok())
            .unwrap_or(false)
    }

    /// Deliver an event to every connection; returns how many accepted it
    pub fn publish(&self, event: ServerEvent) -> usize {
        self.publish_filtered(event, |_| true)
    }

    /// Deliver an event to the connections whose role matches `predicate`
    pub fn publish_filtered<F>(&self, event: ServerEvent, predicate: F) -> usize
    where
        F: Fn(&ClientRole) -> bool,
    {
        let kind = event.kind();
        let event = Arc::new(event);
        let delivered = self
            .connections
            .iter()
            .filter(|entry| predicate(&entry.role))
            .filter(|entry| entry.sender.send(Outbound::Event(event.clone())).is_ok())
            .count();
        debug!("Published {} to {} client(s)", kind, delivered);
        delivered
    }

    /// Display ids with at least one live connection
    pub fn connected_displays(&self) -> BTreeSet<String> {
        self.connections
            .iter()
            .filter_map(|entry| entry.role.display_id().map(str::to_string))
            .collect()
    }

    pub fn is_display_connected(&self, display_id: &str) -> bool {
        self.connections
            .iter()
            .any(|entry| entry.role.display_id() == Some(display_id))
    }

    /// Record a pong (or any traffic) from a connection
    pub fn mark_alive(&self, id: ConnectionId) {
        if let Some(mut handle) = self.connections.get_mut(&id) {
            handle.alive = true;
        }
    }

    /// One keepalive round.
    ///
    /// Connections that did not answer the previous ping are closed and
    /// returned; every other connection is pinged and must answer before the
    /// next round.
    pub fn keepalive_sweep(&self) -> Vec<(ConnectionId, ClientRole)> {
        let mut dead = Vec::new();
        for mut entry in self.connections.iter_mut() {
            if !entry.alive || entry.sender.is_closed() {
                dead.push(*entry.key());
                continue;
            }
            entry.alive = false;
            let _ = entry.sender.send(Outbound::Ping);
        }

        dead.into_iter()
            .filter_map(|id| {
                self.connections.remove(&id).map(|(_, handle)| {
                    let _ = handle.sender.send(Outbound::Close);
                    info!("Dropping unresponsive connection {}", id);
                    (id, handle.role)
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
