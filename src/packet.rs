//! # Packet Model
//!
//! Types shared by every stage of the intake pipeline. A [`RawPacket`] is produced by a
//! transport's decode step and is never mutated afterwards; the router derives a
//! [`ResolvedPacket`] from it once the sender identity and addressing have been worked out.
//!
//! Both networks address nodes with 32-bit numbers. The companion network frequently
//! cannot supply one and hands us a [`KeyPrefix`] instead, so `sender_raw` may be the
//! [`UNKNOWN_NODE`] sentinel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric node identity used on both networks.
pub type NodeId = u32;

/// Reserved "not a specific node" value. Used both as the broadcast destination and as
/// the sender value when the transport could not name the sender.
pub const UNKNOWN_NODE: NodeId = 0xFFFF_FFFF;

/// Broadcast destination (same reserved value as [`UNKNOWN_NODE`] on both networks).
pub const BROADCAST_ADDR: NodeId = UNKNOWN_NODE;

/// Length of the public-key prefix the companion firmware uses to identify peers.
pub const KEY_PREFIX_LEN: usize = 6;

/// Returns true when `id` names a specific node.
#[inline]
pub fn is_concrete(id: NodeId) -> bool {
    id != UNKNOWN_NODE && id != 0
}

/// Format a node id the way Meshtastic clients show it (`!a1b2c3d4`).
pub fn node_label(id: NodeId) -> String {
    if id == UNKNOWN_NODE {
        "unknown".to_string()
    } else {
        format!("!{:08x}", id)
    }
}

/// Which radio network a packet or reply belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkTag {
    Primary,
    Companion,
}

impl NetworkTag {
    pub const ALL: [NetworkTag; 2] = [NetworkTag::Primary, NetworkTag::Companion];

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkTag::Primary => "primary",
            NetworkTag::Companion => "companion",
        }
    }

    /// Stable byte used when hashing packet content.
    pub(crate) fn discriminant(&self) -> u8 {
        match self {
            NetworkTag::Primary => 1,
            NetworkTag::Companion => 2,
        }
    }
}

impl fmt::Display for NetworkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leading bytes of a companion node's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyPrefix(pub [u8; KEY_PREFIX_LEN]);

impl KeyPrefix {
    /// Build a prefix from the start of a longer key. Returns `None` if too short.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < KEY_PREFIX_LEN {
            return None;
        }
        let mut out = [0u8; KEY_PREFIX_LEN];
        out.copy_from_slice(&bytes[..KEY_PREFIX_LEN]);
        Some(KeyPrefix(out))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPrefix({})", self.to_hex())
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for KeyPrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() < KEY_PREFIX_LEN * 2 {
            return Err(format!("key prefix '{}' is shorter than {} bytes", s, KEY_PREFIX_LEN));
        }
        let mut out = [0u8; KEY_PREFIX_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            let pair = s
                .get(i * 2..i * 2 + 2)
                .ok_or_else(|| format!("key prefix '{}' is not valid hex", s))?;
            *slot = u8::from_str_radix(pair, 16)
                .map_err(|_| format!("key prefix '{}' is not valid hex", s))?;
        }
        Ok(KeyPrefix(out))
    }
}

impl Serialize for KeyPrefix {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for KeyPrefix {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What a packet carries. Only [`PayloadKind::Text`] is a message; everything else is
/// node data destined for the node database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Text,
    Telemetry,
    Position,
    NodeInfo,
    Routing,
    Other(u32),
}

impl PayloadKind {
    pub fn is_message(&self) -> bool {
        matches!(self, PayloadKind::Text)
    }
}

/// Link-quality details reported alongside a packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalMetrics {
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub hops: Option<u8>,
    /// Relay path, ordered from the sender outwards.
    pub path: Vec<NodeId>,
}

/// Envelope produced by a transport's decode step.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub sender_raw: NodeId,
    pub receiver_raw: NodeId,
    pub network: NetworkTag,
    pub channel: u32,
    pub payload_kind: PayloadKind,
    pub payload: Vec<u8>,
    pub signal: SignalMetrics,
    pub reception_time: DateTime<Utc>,
    /// Public-key prefix, when the transport identifies senders that way.
    pub key_prefix: Option<KeyPrefix>,
    /// Display name decoded from the frame itself (node-info packets, device contact list).
    pub sender_name: Option<String>,
}

impl RawPacket {
    /// A text packet with empty metrics; transports fill in the rest field by field.
    pub fn text(network: NetworkTag, sender: NodeId, receiver: NodeId, text: &str) -> Self {
        RawPacket {
            sender_raw: sender,
            receiver_raw: receiver,
            network,
            channel: 0,
            payload_kind: PayloadKind::Text,
            payload: text.as_bytes().to_vec(),
            signal: SignalMetrics::default(),
            reception_time: Utc::now(),
            key_prefix: None,
            sender_name: None,
        }
    }

    /// Addressed to the broadcast destination of its network.
    pub fn is_broadcast(&self) -> bool {
        self.receiver_raw == BROADCAST_ADDR
    }

    /// Payload as UTF-8 text (lossy).
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// How the sender identity of a packet was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Transport supplied a concrete node id.
    Concrete,
    /// Found a stored contact by public-key prefix.
    KeyPrefix,
    /// No stored contact; id derived from the prefix bytes.
    ProvisionalKeyPrefix,
    /// Unique display-name match on a `"<name>: "` text prefix.
    NamePrefix,
    /// Nothing matched; sender is the unknown sentinel.
    Unresolved,
}

/// A packet after identity resolution and classification.
#[derive(Debug, Clone)]
pub struct ResolvedPacket {
    pub raw: RawPacket,
    pub resolved_sender_id: NodeId,
    pub resolution: Resolution,
    pub is_broadcast: bool,
    pub is_direct_message: bool,
    pub display_text: String,
}

impl ResolvedPacket {
    pub fn network(&self) -> NetworkTag {
        self.raw.network
    }

    pub fn sender_resolved(&self) -> bool {
        is_concrete(self.resolved_sender_id)
    }
}
