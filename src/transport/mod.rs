//! # Radio Transports
//!
//! A transport owns one byte link to one radio and turns its frames into [`RawPacket`]s.
//! Transports are shared as `Arc<dyn Transport>`: the supervisor that created one keeps
//! the only long-lived reference, everybody else clones the `Arc` for a single operation.
//!
//! | Transport                                   | Network   | Raw frames | Decode | Direct |
//! |---------------------------------------------|-----------|:----------:|:------:|:------:|
//! | [`meshtastic::MeshtasticTransport`]         | primary   | yes        | yes    | yes    |
//! | [`meshcore::CompanionTransport`] (frame)    | companion | yes        | yes    | no     |
//! | [`meshcore::CompanionTransport`] (client)   | companion | no         | yes    | yes    |

pub mod framer;
pub mod link;
pub mod meshcore;
pub mod meshtastic;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::packet::{KeyPrefix, NodeId, RawPacket};
use crate::supervisor::SupervisorRole;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("invalid device '{0}'")]
    InvalidDevice(String),

    #[error("serial port error: {0}")]
    Serial(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport closed")]
    Closed,

    #[error("undecodable frame: {0}")]
    Decode(String),

    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),

    #[error("timed out {0}")]
    Timeout(String),
}

impl TransportError {
    /// Errors that retrying quickly will not fix (missing device, bad descriptor).
    pub fn is_configuration(&self) -> bool {
        matches!(self, TransportError::DeviceNotFound(_) | TransportError::InvalidDevice(_))
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, TransportError::Decode(_))
    }

    /// Errors that mean the link itself is gone, as opposed to a refused operation.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_)
                | TransportError::Serial(_)
                | TransportError::NotConnected
                | TransportError::Closed
                | TransportError::Timeout(_)
        )
    }
}

/// What a transport can do. The transport router picks lanes from these flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Accepts raw framed writes (channel broadcasts go straight to the radio).
    pub raw_frames: bool,
    /// Decodes inbound traffic into packets and can own a read loop.
    pub decode: bool,
    /// Can address a single node (by node id or key prefix).
    pub direct_addressing: bool,
}

/// Where a radio lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDescriptor {
    Serial { path: String, baud: u32 },
    Tcp { host: String, port: u16 },
}

impl DeviceDescriptor {
    /// Parse `tcp://host[:port]`, `host:port`, or a serial device path.
    pub fn parse(spec: &str, baud: u32, default_tcp_port: u16) -> Result<Self, TransportError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(TransportError::InvalidDevice(spec.to_string()));
        }
        if let Some(rest) = spec.strip_prefix("tcp://") {
            return Self::parse_host_port(rest, Some(default_tcp_port))
                .ok_or_else(|| TransportError::InvalidDevice(spec.to_string()));
        }
        let looks_like_path = spec.starts_with('/')
            || spec.starts_with('.')
            || spec.to_ascii_uppercase().starts_with("COM");
        if !looks_like_path {
            if let Some(tcp) = Self::parse_host_port(spec, None) {
                return Ok(tcp);
            }
        }
        Ok(DeviceDescriptor::Serial {
            path: spec.to_string(),
            baud,
        })
    }

    fn parse_host_port(s: &str, default_port: Option<u16>) -> Option<Self> {
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Some(DeviceDescriptor::Tcp {
                host: host.to_string(),
                port: port.parse().ok()?,
            }),
            Some(_) => None,
            None if !s.is_empty() => default_port.map(|port| DeviceDescriptor::Tcp {
                host: s.to_string(),
                port,
            }),
            None => None,
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceDescriptor::Serial { path, baud } => write!(f, "{}@{}", path, baud),
            DeviceDescriptor::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

/// One inbound frame as seen by a read loop.
#[derive(Debug, Clone)]
pub enum ReadEvent {
    /// A decoded packet for the router.
    Packet(RawPacket),
    /// A frame with nothing to route: config replay, encrypted traffic, adverts, path
    /// updates, command acks, even a frame that failed to decode. It still proves the
    /// radio is talking to us.
    Observed,
}

impl ReadEvent {
    pub fn into_packet(self) -> Option<RawPacket> {
        match self {
            ReadEvent::Packet(packet) => Some(packet),
            ReadEvent::Observed => None,
        }
    }
}

/// Destination of a direct message. Companion radios address peers by key prefix,
/// primary radios by node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectTarget {
    pub node_id: NodeId,
    pub key_prefix: Option<KeyPrefix>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// The radio's own node id, once the radio has told us.
    fn local_node_id(&self) -> Option<NodeId>;

    /// Next inbound frame. `Ok(None)` means the link reached end of stream.
    /// Undecodable frames are logged and reported as [`ReadEvent::Observed`].
    async fn read_next(&self) -> Result<Option<ReadEvent>, TransportError>;

    /// Frame and write an already-encoded radio command.
    async fn write(&self, payload: &[u8]) -> Result<(), TransportError>;

    async fn send_broadcast(&self, channel: u32, text: &str) -> Result<(), TransportError>;

    async fn send_direct(&self, target: &DirectTarget, text: &str) -> Result<(), TransportError>;

    /// Periodic nudge so idle links are not dropped by the radio. Default: nothing.
    async fn keepalive(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Close the link. Pending and future reads return [`TransportError::Closed`].
    async fn close(&self);
}

/// Builds transports for one kind of radio link.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Open a transport for a lane of the given role. A send-only lane must not start
    /// anything that makes the radio hand over inbound traffic.
    async fn connect(
        &self,
        device: &DeviceDescriptor,
        role: SupervisorRole,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Split `text` into pieces of at most `max_bytes`, on char boundaries.
pub fn split_text(text: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(4);
    let mut parts = Vec::new();
    let mut rest = text;
    while rest.len() > max_bytes {
        let mut cut = max_bytes;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        // Prefer breaking at the last whitespace in the second half of the piece
        if let Some(ws) = rest[..cut].rfind(char::is_whitespace) {
            if ws >= cut / 2 {
                cut = ws + 1;
            }
        }
        parts.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    if !rest.is_empty() || parts.is_empty() {
        parts.push(rest);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_descriptors() {
        assert_eq!(
            DeviceDescriptor::parse("/dev/ttyUSB0", 115200, 4403).unwrap(),
            DeviceDescriptor::Serial {
                path: "/dev/ttyUSB0".into(),
                baud: 115200
            }
        );
        assert_eq!(
            DeviceDescriptor::parse("radio.local:4403", 115200, 4403).unwrap(),
            DeviceDescriptor::Tcp {
                host: "radio.local".into(),
                port: 4403
            }
        );
        assert_eq!(
            DeviceDescriptor::parse("tcp://10.0.0.5", 115200, 5000).unwrap(),
            DeviceDescriptor::Tcp {
                host: "10.0.0.5".into(),
                port: 5000
            }
        );
        assert!(DeviceDescriptor::parse("  ", 115200, 4403).is_err());
        assert!(DeviceDescriptor::parse("tcp://host:notaport", 115200, 4403).is_err());
    }

    #[test]
    fn configuration_errors_are_classified() {
        assert!(TransportError::DeviceNotFound("/dev/x".into()).is_configuration());
        assert!(!TransportError::Closed.is_configuration());
        assert!(TransportError::Decode("short".into()).is_decode());
        assert!(TransportError::Closed.is_link_failure());
        assert!(!TransportError::Unsupported("direct messages").is_link_failure());
    }

    #[test]
    fn split_text_respects_limits_and_boundaries() {
        assert_eq!(split_text("hello", 200), vec!["hello"]);
        assert_eq!(split_text("", 200), vec![""]);
        let parts = split_text("aaaa bbbb cccc", 10);
        assert_eq!(parts, vec!["aaaa bbbb ", "cccc"]);
        let emoji = "😀😀😀";
        for part in split_text(emoji, 5) {
            assert!(part.len() <= 5);
            assert!(!part.is_empty());
        }
    }
}
