//! Last-known-value cache keyed by node, device and channel.

use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Distinct channels kept per node; reports for further channels are dropped.
pub const MAX_CHANNELS_PER_NODE: usize = 16;

/// Address of one reported channel: (node id, device type, channel index).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub node_id: NodeId,
    pub device: String,
    pub channel: u32,
}

impl ChannelKey {
    pub fn new(node_id: NodeId, device: impl Into<String>, channel: u32) -> Self {
        Self {
            node_id,
            device: device.into(),
            channel,
        }
    }
}

/// The last payload a node reported for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPayload {
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Cache of the last report per channel.
///
/// Only written by hardware reports, never by commands, so every key
/// belongs to a node that has actually reported. Ordered so catch-up
/// replays are deterministic.
#[derive(Debug, Clone, Default)]
pub struct StateCache {
    entries: BTreeMap<ChannelKey, CachedPayload>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the payload for a channel, replacing any previous value.
    ///
    /// A channel not seen before is only added while its node holds fewer
    /// than `MAX_CHANNELS_PER_NODE` entries. Returns whether it was stored.
    pub fn record(&mut self, key: ChannelKey, payload: serde_json::Value) -> bool {
        if !self.entries.contains_key(&key)
            && self.channel_count(&key.node_id) >= MAX_CHANNELS_PER_NODE
        {
            return false;
        }

        self.entries.insert(
            key,
            CachedPayload {
                payload,
                updated_at: Utc::now(),
            },
        );
        true
    }

    pub fn get(&self, key: &ChannelKey) -> Option<&CachedPayload> {
        self.entries.get(key)
    }

    /// Iterates every cached channel of one node.
    pub fn entries_for<'a>(
        &'a self,
        node_id: &'a NodeId,
    ) -> impl Iterator<Item = (&'a ChannelKey, &'a CachedPayload)> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key.node_id == *node_id)
    }

    pub fn channel_count(&self, node_id: &NodeId) -> usize {
        self.entries_for(node_id).count()
    }

    pub fn contains_node(&self, node_id: &NodeId) -> bool {
        self.entries.keys().any(|key| key.node_id == *node_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
