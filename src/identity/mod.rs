//! # Sender Identity Resolution
//!
//! Works out who actually sent a packet. The primary network always names the sender;
//! the companion network names direct-message senders only by a public-key prefix and
//! channel-message senders only by a `"<name>: "` text prefix. Resolution tries, in
//! strict order, first match wins:
//!
//! 1. concrete `sender_raw`,
//! 2. key prefix (stored contact, else a provisional id derived from the prefix bytes),
//! 3. broadcast text name prefix with a unique contact match,
//! 4. the unknown sentinel.
//!
//! Rules 2 and 3 never produce the bot's own id: attributing somebody else's message to
//! ourselves makes the router treat it as an echo of our own traffic.

pub mod contacts;

use chrono::Utc;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::logutil::escape_log;
use crate::packet::{
    is_concrete, node_label, KeyPrefix, NetworkTag, NodeId, RawPacket, Resolution, UNKNOWN_NODE,
};

pub use contacts::{ContactBook, ContactRecord, ContactStore, ContactStoreError};

/// Longest display name accepted in a `"<name>: "` prefix.
pub const MAX_NAME_PREFIX_CHARS: usize = 32;

/// Minimum age of a contact's `last_seen` before another sighting rewrites it. Every
/// rewrite persists the whole book.
const REFRESH_INTERVAL: chrono::Duration = chrono::Duration::minutes(5);

/// The bot's own node id on each network, as configured or reported by the radio.
#[derive(Debug, Default)]
pub struct LocalIdentity {
    ids: RwLock<HashMap<NetworkTag, NodeId>>,
}

impl LocalIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, network: NetworkTag, id: NodeId) {
        if !is_concrete(id) {
            return;
        }
        if let Ok(mut ids) = self.ids.write() {
            if ids.insert(network, id) != Some(id) {
                debug!("Own node id on {} network is {}", network, node_label(id));
            }
        }
    }

    pub fn get(&self, network: NetworkTag) -> Option<NodeId> {
        self.ids.read().ok().and_then(|ids| ids.get(&network).copied())
    }

    pub fn is_own(&self, network: NetworkTag, id: NodeId) -> bool {
        is_concrete(id) && self.get(network) == Some(id)
    }
}

/// Deterministic provisional id for a sender known only by key prefix.
///
/// Uses the first four prefix bytes big-endian; if that lands on a reserved value the
/// last two bytes are folded in under a fixed marker so the result is still concrete.
pub fn provisional_id(prefix: &KeyPrefix) -> NodeId {
    let b = prefix.0;
    let id = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
    if is_concrete(id) {
        id
    } else {
        0x7E00_0000 | (u16::from_be_bytes([b[4], b[5]]) as u32)
    }
}

/// Split `"<name>: <rest>"`. Returns `None` unless the name looks like a display name.
pub fn split_name_prefix(text: &str) -> Option<(&str, &str)> {
    let idx = text.find(": ")?;
    let name = text[..idx].trim();
    if name.is_empty()
        || name.chars().count() > MAX_NAME_PREFIX_CHARS
        || name.chars().any(|c| c.is_control())
    {
        return None;
    }
    Some((name, &text[idx + 2..]))
}

/// Result of [`SenderIdentityResolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub sender_id: NodeId,
    pub resolution: Resolution,
    /// Message text with any sender-name artifact removed. Empty for non-text payloads.
    pub display_text: String,
}

pub struct SenderIdentityResolver {
    store: Arc<dyn ContactStore>,
    local: Arc<LocalIdentity>,
}

impl SenderIdentityResolver {
    pub fn new(store: Arc<dyn ContactStore>, local: Arc<LocalIdentity>) -> Self {
        Self { store, local }
    }

    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    pub fn resolve(&self, packet: &RawPacket) -> Identity {
        let text = if packet.payload_kind.is_message() {
            packet.text_lossy()
        } else {
            String::new()
        };

        // Companion channel firmware always prepends the sender name; that prefix is a
        // protocol artifact and never part of the command text.
        let name_split = if packet.payload_kind.is_message() && packet.is_broadcast() {
            split_name_prefix(&text).map(|(n, rest)| (n.to_string(), rest.to_string()))
        } else {
            None
        };
        let artifact_stripped = match (&name_split, packet.network) {
            (Some((_, rest)), NetworkTag::Companion) => rest.clone(),
            _ => text.clone(),
        };

        if is_concrete(packet.sender_raw) {
            self.refresh_concrete(packet);
            return Identity {
                sender_id: packet.sender_raw,
                resolution: Resolution::Concrete,
                display_text: artifact_stripped,
            };
        }

        if let Some(prefix) = packet.key_prefix {
            if let Some((id, resolution)) = self.resolve_by_prefix(packet, &prefix) {
                return Identity {
                    sender_id: id,
                    resolution,
                    display_text: artifact_stripped,
                };
            }
            return Identity {
                sender_id: UNKNOWN_NODE,
                resolution: Resolution::Unresolved,
                display_text: artifact_stripped,
            };
        }

        if let Some((name, rest)) = &name_split {
            if let Some(id) = self.resolve_by_name(packet.network, name) {
                return Identity {
                    sender_id: id,
                    resolution: Resolution::NamePrefix,
                    display_text: rest.clone(),
                };
            }
        }

        trace!(
            "Sender unresolved on {} network: '{}'",
            packet.network,
            escape_log(&artifact_stripped)
        );
        Identity {
            sender_id: UNKNOWN_NODE,
            resolution: Resolution::Unresolved,
            display_text: artifact_stripped,
        }
    }

    fn refresh_concrete(&self, packet: &RawPacket) {
        let now = Utc::now();
        let existing = match self.store.lookup_by_node_id(packet.network, packet.sender_raw) {
            Ok(found) => found,
            Err(e) => {
                warn!("Contact lookup for {} failed: {}", node_label(packet.sender_raw), e);
                return;
            }
        };
        let record = match existing {
            Some(mut rec) => {
                let renamed = matches!(&packet.sender_name, Some(n) if *n != rec.display_name);
                if !renamed && now - rec.last_seen < REFRESH_INTERVAL {
                    return;
                }
                if let Some(name) = &packet.sender_name {
                    rec.display_name = name.clone();
                }
                rec.last_seen = now;
                rec
            }
            None => {
                let name = packet
                    .sender_name
                    .clone()
                    .unwrap_or_else(|| node_label(packet.sender_raw));
                ContactRecord::new(packet.sender_raw, name, packet.network)
            }
        };
        if let Err(e) = self.store.upsert(record) {
            warn!("Contact upsert for {} failed: {}", node_label(packet.sender_raw), e);
        }
    }

    fn resolve_by_prefix(&self, packet: &RawPacket, prefix: &KeyPrefix) -> Option<(NodeId, Resolution)> {
        let found = match self.store.lookup_by_key_prefix(prefix) {
            Ok(found) => found,
            Err(e) => {
                warn!("Contact lookup for prefix {} failed: {}", prefix, e);
                None
            }
        };

        let (record, resolution, changed) = match found {
            Some(mut rec) => {
                let now = Utc::now();
                let renamed = matches!(&packet.sender_name, Some(n) if *n != rec.display_name);
                let stale = now - rec.last_seen >= REFRESH_INTERVAL;
                if renamed || stale {
                    rec.last_seen = now;
                    if let Some(name) = &packet.sender_name {
                        rec.display_name = name.clone();
                    }
                }
                (rec, Resolution::KeyPrefix, renamed || stale)
            }
            None => {
                let id = provisional_id(prefix);
                debug!(
                    "New companion sender {} -> provisional id {}",
                    prefix,
                    node_label(id)
                );
                let name = packet.sender_name.clone().unwrap_or_else(|| prefix.to_hex());
                let rec = ContactRecord::new(id, name, packet.network).with_key_prefix(*prefix);
                (rec, Resolution::ProvisionalKeyPrefix, true)
            }
        };

        if self.local.is_own(packet.network, record.node_id) {
            debug!("Key prefix {} maps to our own id; leaving sender unresolved", prefix);
            return None;
        }

        let id = record.node_id;
        if changed {
            if let Err(e) = self.store.upsert(record) {
                warn!("Contact upsert for prefix {} failed: {}", prefix, e);
            }
        }
        Some((id, resolution))
    }

    fn resolve_by_name(&self, network: NetworkTag, name: &str) -> Option<NodeId> {
        let hits = match self.store.lookup_by_name(name) {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Contact lookup for name '{}' failed: {}", escape_log(name), e);
                return None;
            }
        };
        let same_network: Vec<&ContactRecord> = hits.iter().filter(|c| c.network == network).collect();
        match same_network.as_slice() {
            [only] => {
                if self.local.is_own(network, only.node_id) {
                    debug!("Name prefix '{}' matches our own node; not attributing", escape_log(name));
                    None
                } else {
                    Some(only.node_id)
                }
            }
            [] => None,
            many => {
                debug!(
                    "Name prefix '{}' is ambiguous ({} contacts); leaving sender unresolved",
                    escape_log(name),
                    many.len()
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisional_id_is_deterministic_and_concrete() {
        let p = KeyPrefix([0xde, 0xad, 0xbe, 0xef, 0x01, 0x02]);
        assert_eq!(provisional_id(&p), 0xdeadbeef);
        assert_eq!(provisional_id(&p), provisional_id(&p));
        let reserved = KeyPrefix([0xff, 0xff, 0xff, 0xff, 0x12, 0x34]);
        assert_eq!(provisional_id(&reserved), 0x7E00_1234);
        let zero = KeyPrefix([0, 0, 0, 0, 0, 0]);
        assert!(is_concrete(provisional_id(&zero)));
    }

    #[test]
    fn name_prefix_split_rules() {
        assert_eq!(split_name_prefix("Alice: ping"), Some(("Alice", "ping")));
        assert_eq!(split_name_prefix("Alice:ping"), None);
        assert_eq!(split_name_prefix(": ping"), None);
        let long = format!("{}: hi", "x".repeat(MAX_NAME_PREFIX_CHARS + 1));
        assert_eq!(split_name_prefix(&long), None);
    }
}
