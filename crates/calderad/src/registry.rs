//! Connection registry: who is connected, under which role.
//!
//! Hardware nodes are keyed by their node id, so a reconnecting node
//! replaces its previous entry (last writer wins). Observers are keyed
//! by connection and never collide.
//!
//! Removal always goes through [`ConnectionRegistry::evict`] or
//! [`ConnectionRegistry::evict_connection`]; the latter only removes an
//! entry still owned by the given connection, so a late disconnect from
//! a replaced connection cannot take down its successor.

use std::collections::HashMap;

use caldera_core::{ClientRole, NodeId};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::peer::{ConnectionHandle, ConnectionId, PeerKey};

/// Bookkeeping attached to a registry entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerMetadata {
    /// Remote address of the connection
    pub address: Option<String>,

    /// Hardware identifier announced at registration (e.g. a MAC)
    pub hardware_id: Option<String>,

    /// Who last sent a command to this node
    pub last_commander: Option<String>,

    pub last_command_at: Option<DateTime<Utc>>,
}

/// One registered connection.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub role: ClientRole,
    pub handle: ConnectionHandle,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    /// Probes sent since the last inbound frame
    pub missed_probes: u32,

    pub metadata: PeerMetadata,
}

impl PeerEntry {
    pub fn connection(&self) -> ConnectionId {
        self.handle.id()
    }
}

/// Result of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created,

    /// An entry with the same id existed and was superseded
    Replaced { previous: ConnectionId },
}

/// Fixed copy of an entry taken for one liveness tick.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub key: PeerKey,
    pub handle: ConnectionHandle,
    pub missed_probes: u32,
}

/// Number of registered entries per role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    pub actuators: usize,
    pub sensors: usize,
    pub observers: usize,
}

impl RegistryCounts {
    pub fn total(&self) -> usize {
        self.actuators + self.sensors + self.observers
    }
}

/// Owned map of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<PeerKey, PeerEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, replacing any previous entry under the same key.
    ///
    /// The replaced handle is not closed here; its own read loop ends it.
    pub fn register(
        &mut self,
        key: PeerKey,
        role: ClientRole,
        handle: ConnectionHandle,
        metadata: PeerMetadata,
    ) -> RegistrationOutcome {
        let now = Utc::now();
        let entry = PeerEntry {
            role,
            handle,
            registered_at: now,
            last_seen: now,
            missed_probes: 0,
            metadata,
        };

        match self.entries.insert(key, entry) {
            Some(previous) => RegistrationOutcome::Replaced {
                previous: previous.connection(),
            },
            None => RegistrationOutcome::Created,
        }
    }

    pub fn lookup(&self, key: &PeerKey) -> Option<&PeerEntry> {
        self.entries.get(key)
    }

    pub fn node(&self, id: &NodeId) -> Option<&PeerEntry> {
        self.entries.get(&PeerKey::Node(id.clone()))
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Whether `key` is currently held by `connection`.
    pub fn is_current(&self, key: &PeerKey, connection: ConnectionId) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.connection() == connection)
    }

    /// Records inbound traffic: resets the probe counter and `last_seen`.
    ///
    /// Returns false when the frame came from a connection that no
    /// longer owns the entry.
    pub fn touch(&mut self, key: &PeerKey, connection: ConnectionId) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.connection() == connection => {
                entry.last_seen = Utc::now();
                entry.missed_probes = 0;
                true
            }
            _ => false,
        }
    }

    /// Counts a probe sent to the entry; returns the new count.
    pub fn record_probe(&mut self, key: &PeerKey, connection: ConnectionId) -> Option<u32> {
        match self.entries.get_mut(key) {
            Some(entry) if entry.connection() == connection => {
                entry.missed_probes = entry.missed_probes.saturating_add(1);
                Some(entry.missed_probes)
            }
            _ => None,
        }
    }

    /// Notes which client last commanded a node.
    pub fn record_commander(&mut self, id: &NodeId, commander: String) {
        if let Some(entry) = self.entries.get_mut(&PeerKey::Node(id.clone())) {
            entry.metadata.last_commander = Some(commander);
            entry.metadata.last_command_at = Some(Utc::now());
        }
    }

    /// Removes an entry regardless of owner. Absent keys are a no-op.
    pub fn evict(&mut self, key: &PeerKey) -> Option<PeerEntry> {
        self.entries.remove(key)
    }

    /// Removes an entry only while `connection` still owns it.
    pub fn evict_connection(
        &mut self,
        key: &PeerKey,
        connection: ConnectionId,
    ) -> Option<PeerEntry> {
        if self.is_current(key, connection) {
            self.entries.remove(key)
        } else {
            None
        }
    }

    /// Registered hardware nodes, ordered by id.
    pub fn nodes(&self) -> Vec<(&NodeId, &PeerEntry)> {
        let mut nodes: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(key, entry)| key.node_id().map(|id| (id, entry)))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(b.0));
        nodes
    }

    /// Copy of every observer handle, for one broadcast.
    pub(crate) fn observer_handles(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.role == ClientRole::Observer)
            .map(|entry| entry.handle.clone())
            .collect();
        handles.sort_by_key(ConnectionHandle::id);
        handles
    }

    /// Copy of every entry, for one liveness tick.
    pub(crate) fn probe_targets(&self) -> Vec<ProbeTarget> {
        self.entries
            .iter()
            .map(|(key, entry)| ProbeTarget {
                key: key.clone(),
                handle: entry.handle.clone(),
                missed_probes: entry.missed_probes,
            })
            .collect()
    }

    pub fn counts(&self) -> RegistryCounts {
        let mut counts = RegistryCounts::default();
        for entry in self.entries.values() {
            match entry.role {
                ClientRole::Actuator => counts.actuators += 1,
                ClientRole::Sensor => counts.sensors += 1,
                ClientRole::Observer => counts.observers += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
