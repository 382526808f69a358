//! Primary-network transport speaking the Meshtastic client API over serial or TCP.
//!
//! On connect the transport asks the radio for its configuration (`want_config_id`);
//! the answer carries our own node number and the node database, which we mine for
//! display names. After that every `FromRadio.packet` with a decoded payload becomes a
//! [`RawPacket`]; every other frame, encrypted packets included, is reported as
//! [`ReadEvent::Observed`] so the supervisor still sees the radio talking.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use log::{debug, info, trace, warn};
use prost::Message;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

use super::framer::{encode_frame, FrameFormat, StreamFramer};
use super::link::Link;
use super::{
    split_text, Capabilities, DeviceDescriptor, DirectTarget, ReadEvent, Transport, TransportError, TransportFactory,
};
use crate::logutil::{escape_log, hex_snippet};
use crate::metrics;
use crate::packet::{
    is_concrete, node_label, NetworkTag, NodeId, PayloadKind, RawPacket, SignalMetrics, BROADCAST_ADDR,
};
use crate::protobuf::{self as proto, port};
use crate::supervisor::SupervisorRole;

/// Longest text payload we put in a single packet.
pub const MAX_TEXT_BYTES: usize = 200;

const DEFAULT_HOP_LIMIT: u32 = 3;

pub const CAPABILITIES: Capabilities = Capabilities {
    raw_frames: true,
    decode: true,
    direct_addressing: true,
};

pub struct MeshtasticFactory {
    connect_timeout: Duration,
}

impl MeshtasticFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl TransportFactory for MeshtasticFactory {
    fn name(&self) -> &str {
        "meshtastic"
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    async fn connect(
        &self,
        device: &DeviceDescriptor,
        _role: SupervisorRole,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        // The radio streams to every connected client, so a send-only session still
        // needs the config replay for its own node id.
        let link = Link::open(device, self.connect_timeout).await?;
        let transport = MeshtasticTransport::new(link);
        transport.request_config().await?;
        Ok(Arc::new(transport))
    }
}

pub struct MeshtasticTransport {
    link: Link,
    framer: Mutex<StreamFramer>,
    local_id: AtomicU32,
    names: StdMutex<HashMap<NodeId, String>>,
}

impl MeshtasticTransport {
    pub fn new(link: Link) -> Self {
        Self {
            link,
            framer: Mutex::new(StreamFramer::new(FrameFormat::Meshtastic)),
            local_id: AtomicU32::new(0),
            names: StdMutex::new(HashMap::new()),
        }
    }

    /// Ask the radio to replay its configuration and node database.
    pub async fn request_config(&self) -> Result<(), TransportError> {
        let id: u32 = rand::thread_rng().gen_range(1..u32::MAX);
        info!("Requesting config from {} (want_config_id=0x{:08x})", self.link.label(), id);
        self.send_to_radio(proto::ToRadio {
            want_config_id: Some(id),
            ..Default::default()
        })
        .await
    }

    async fn send_to_radio(&self, msg: proto::ToRadio) -> Result<(), TransportError> {
        self.write(&msg.encode_to_vec()).await
    }

    async fn send_text(&self, to: NodeId, channel: u32, text: &str) -> Result<(), TransportError> {
        let direct = to != BROADCAST_ADDR;
        for part in split_text(text, MAX_TEXT_BYTES) {
            let packet = proto::MeshPacket {
                to,
                channel,
                id: rand::thread_rng().gen_range(1..u32::MAX),
                want_ack: direct,
                hop_limit: DEFAULT_HOP_LIMIT,
                decoded: Some(proto::Data {
                    portnum: port::TEXT_MESSAGE,
                    payload: part.as_bytes().to_vec(),
                    ..Default::default()
                }),
                ..Default::default()
            };
            debug!(
                "TX text to {} ch{} ({} bytes{})",
                node_label(to),
                channel,
                part.len(),
                if direct { ", want_ack" } else { "" }
            );
            self.send_to_radio(proto::ToRadio {
                packet: Some(packet),
                ..Default::default()
            })
            .await?;
        }
        Ok(())
    }

    fn remember_name(&self, id: NodeId, user: &proto::User) {
        let name = if !user.long_name.trim().is_empty() {
            user.long_name.trim()
        } else {
            user.short_name.trim()
        };
        if name.is_empty() || !is_concrete(id) {
            return;
        }
        if let Ok(mut names) = self.names.lock() {
            names.insert(id, name.to_string());
        }
    }

    fn name_of(&self, id: NodeId) -> Option<String> {
        self.names.lock().ok().and_then(|n| n.get(&id).cloned())
    }

    /// Decode one `FromRadio` frame. [`ReadEvent::Observed`] for frames that carry no
    /// routable packet.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<ReadEvent, TransportError> {
        let msg = proto::FromRadio::decode(frame)
            .map_err(|e| TransportError::Decode(format!("FromRadio: {}", e)))?;

        if let Some(my_info) = &msg.my_info {
            if is_concrete(my_info.my_node_num) {
                let prev = self.local_id.swap(my_info.my_node_num, Ordering::SeqCst);
                if prev != my_info.my_node_num {
                    info!("Primary radio node id is {}", node_label(my_info.my_node_num));
                }
            }
            return Ok(ReadEvent::Observed);
        }
        if let Some(node) = &msg.node_info {
            if let Some(user) = &node.user {
                self.remember_name(node.num, user);
            }
            return Ok(ReadEvent::Observed);
        }
        if let Some(id) = msg.config_complete_id {
            debug!("Config complete (id=0x{:08x})", id);
            return Ok(ReadEvent::Observed);
        }
        if msg.rebooted == Some(true) {
            warn!("Primary radio reports a reboot");
            return Ok(ReadEvent::Observed);
        }
        let Some(pkt) = msg.packet else {
            return Ok(ReadEvent::Observed);
        };
        let Some(data) = pkt.decoded else {
            trace!("Skipping encrypted packet from {}", node_label(pkt.from));
            return Ok(ReadEvent::Observed);
        };

        let payload_kind = match data.portnum {
            port::TEXT_MESSAGE => PayloadKind::Text,
            port::POSITION => PayloadKind::Position,
            port::NODEINFO => PayloadKind::NodeInfo,
            port::ROUTING => PayloadKind::Routing,
            port::TELEMETRY => PayloadKind::Telemetry,
            other => PayloadKind::Other(other.max(0) as u32),
        };

        if payload_kind == PayloadKind::NodeInfo {
            match proto::User::decode(data.payload.as_slice()) {
                Ok(user) => self.remember_name(pkt.from, &user),
                Err(e) => debug!("Undecodable NodeInfo payload from {}: {}", node_label(pkt.from), e),
            }
        }

        let hops = if pkt.hop_start > 0 && pkt.hop_start >= pkt.hop_limit {
            Some((pkt.hop_start - pkt.hop_limit).min(u8::MAX as u32) as u8)
        } else {
            None
        };
        let reception_time = if pkt.rx_time > 0 {
            Utc.timestamp_opt(pkt.rx_time as i64, 0).single().unwrap_or_else(Utc::now)
        } else {
            Utc::now()
        };

        let raw = RawPacket {
            sender_raw: pkt.from,
            receiver_raw: pkt.to,
            network: NetworkTag::Primary,
            channel: pkt.channel,
            payload_kind,
            payload: data.payload,
            signal: SignalMetrics {
                snr: (pkt.rx_snr != 0.0).then_some(pkt.rx_snr),
                rssi: (pkt.rx_rssi != 0).then_some(pkt.rx_rssi),
                hops,
                path: Vec::new(),
            },
            reception_time,
            key_prefix: None,
            sender_name: self.name_of(pkt.from),
        };
        if raw.payload_kind.is_message() {
            debug!(
                "RX text from {} to {} ch{}: '{}'",
                node_label(raw.sender_raw),
                node_label(raw.receiver_raw),
                raw.channel,
                escape_log(&raw.text_lossy())
            );
        }
        Ok(ReadEvent::Packet(raw))
    }
}

#[async_trait]
impl Transport for MeshtasticTransport {
    fn name(&self) -> &str {
        "meshtastic"
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    fn local_node_id(&self) -> Option<NodeId> {
        let id = self.local_id.load(Ordering::SeqCst);
        is_concrete(id).then_some(id)
    }

    async fn read_next(&self) -> Result<Option<ReadEvent>, TransportError> {
        let mut framer = self.framer.lock().await;
        loop {
            if let Some(frame) = framer.next_frame() {
                return match self.decode_frame(&frame) {
                    Ok(event) => Ok(Some(event)),
                    Err(e) => {
                        metrics::inc_decode_errors();
                        warn!("Dropping frame: {} ({})", e, hex_snippet(&frame, 32));
                        Ok(Some(ReadEvent::Observed))
                    }
                };
            }
            let skipped = framer.take_skipped();
            if skipped > 0 {
                trace!("Skipped {} non-frame bytes from {}", skipped, self.link.label());
            }
            let chunk = self.link.read_chunk().await?;
            if chunk.is_empty() {
                return Ok(None);
            }
            framer.push(&chunk);
        }
    }

    async fn write(&self, payload: &[u8]) -> Result<(), TransportError> {
        let frame = encode_frame(FrameFormat::Meshtastic, payload)?;
        self.link.write_all(&frame).await
    }

    async fn send_broadcast(&self, channel: u32, text: &str) -> Result<(), TransportError> {
        self.send_text(BROADCAST_ADDR, channel, text).await
    }

    async fn send_direct(&self, target: &DirectTarget, text: &str) -> Result<(), TransportError> {
        if !is_concrete(target.node_id) {
            return Err(TransportError::Unsupported("direct send without a node id"));
        }
        self.send_text(target.node_id, 0, text).await
    }

    async fn keepalive(&self) -> Result<(), TransportError> {
        let nonce = rand::thread_rng().gen::<u16>() as u32;
        trace!("Heartbeat to {}", self.link.label());
        self.send_to_radio(proto::ToRadio {
            heartbeat: Some(proto::Heartbeat { nonce }),
            ..Default::default()
        })
        .await
    }

    async fn close(&self) {
        // Tell the radio we are going away; it stops streaming to this client
        if !self.link.is_closed() {
            let _ = self
                .send_to_radio(proto::ToRadio {
                    disconnect: Some(true),
                    ..Default::default()
                })
                .await;
        }
        self.link.close().await;
    }
}
