//! Companion-network transports for MeshCore radios running companion firmware.
//!
//! Two flavours share one session implementation:
//!
//! - **frame**: writes channel frames directly and decodes whatever arrives. It never
//!   fetches the contact list, so it cannot address a peer.
//! - **client**: additionally syncs the radio's contact list (names for key prefixes)
//!   and sends direct messages by key prefix.
//!
//! The radio queues inbound messages; it announces them with a `MSG_WAITING` push and
//! we drain the queue with `SYNC_NEXT_MESSAGE` until it answers `NO_MORE_MESSAGES`.
//! A send-only session never drains: each TCP client gets its own stream, and a message
//! handed to a stream nobody reads is gone.
//! Direct-message senders are identified only by key prefix, so `sender_raw` is always
//! the unknown sentinel on this network.

pub mod codec;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use self::codec::{CompanionFrame, hops_from_path_len};
use super::framer::{encode_frame, FrameFormat, StreamFramer};
use super::link::Link;
use super::{
    split_text, Capabilities, DeviceDescriptor, DirectTarget, ReadEvent, Transport, TransportError, TransportFactory,
};
use crate::identity::provisional_id;
use crate::logutil::{escape_log, hex_snippet};
use crate::metrics;
use crate::packet::{is_concrete, KeyPrefix, NetworkTag, NodeId, RawPacket, SignalMetrics, BROADCAST_ADDR, UNKNOWN_NODE};
use crate::supervisor::SupervisorRole;

/// Longest text the companion firmware accepts in one message.
pub const MAX_TEXT_BYTES: usize = 140;

const APP_NAME: &str = "meshbridge";

/// Adverts arrive in bursts; re-fetch the contact list at most this often.
const CONTACT_REFRESH_MIN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionMode {
    Frame,
    Client,
}

impl CompanionMode {
    pub fn capabilities(self) -> Capabilities {
        match self {
            CompanionMode::Frame => Capabilities {
                raw_frames: true,
                decode: true,
                direct_addressing: false,
            },
            CompanionMode::Client => Capabilities {
                raw_frames: false,
                decode: true,
                direct_addressing: true,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompanionMode::Frame => "companion-frame",
            CompanionMode::Client => "companion-client",
        }
    }
}

pub struct CompanionFactory {
    mode: CompanionMode,
    connect_timeout: Duration,
}

impl CompanionFactory {
    pub fn new(mode: CompanionMode, connect_timeout: Duration) -> Self {
        Self { mode, connect_timeout }
    }
}

#[async_trait]
impl TransportFactory for CompanionFactory {
    fn name(&self) -> &str {
        self.mode.as_str()
    }

    fn capabilities(&self) -> Capabilities {
        self.mode.capabilities()
    }

    async fn connect(
        &self,
        device: &DeviceDescriptor,
        role: SupervisorRole,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let link = Link::open(device, self.connect_timeout).await?;
        let transport = CompanionTransport::new(self.mode, link, role == SupervisorRole::SendOnly);
        transport.start_session().await?;
        Ok(Arc::new(transport))
    }
}

pub struct CompanionTransport {
    mode: CompanionMode,
    send_only: bool,
    link: Link,
    framer: Mutex<StreamFramer>,
    local_id: AtomicU32,
    contacts: StdMutex<HashMap<KeyPrefix, String>>,
    last_contact_refresh: StdMutex<Option<Instant>>,
}

impl CompanionTransport {
    pub fn new(mode: CompanionMode, link: Link, send_only: bool) -> Self {
        Self {
            mode,
            send_only,
            link,
            framer: Mutex::new(StreamFramer::new(FrameFormat::Companion)),
            local_id: AtomicU32::new(0),
            contacts: StdMutex::new(HashMap::new()),
            last_contact_refresh: StdMutex::new(None),
        }
    }

    /// Announce ourselves. A reading session also fetches contacts (client mode) and
    /// drains queued messages; a send-only session stops after `APP_START`.
    pub async fn start_session(&self) -> Result<(), TransportError> {
        info!(
            "Starting {} session on {}{}",
            self.mode.as_str(),
            self.link.label(),
            if self.send_only { " (send-only)" } else { "" }
        );
        self.write(&codec::encode_app_start(APP_NAME)).await?;
        if self.send_only {
            return Ok(());
        }
        if self.mode == CompanionMode::Client {
            self.mark_contact_refresh();
            self.write(&codec::encode_get_contacts()).await?;
        }
        self.write(&codec::encode_sync_next()).await
    }

    /// Ask for the next queued message. A failed write is logged, not returned: the
    /// frame in hand is still delivered and the read side reports a dead link.
    async fn request_next_message(&self) {
        if self.send_only {
            return;
        }
        if let Err(e) = self.write(&codec::encode_sync_next()).await {
            warn!("Sync-next to {} failed: {}", self.link.label(), e);
        }
    }

    fn mark_contact_refresh(&self) {
        if let Ok(mut last) = self.last_contact_refresh.lock() {
            *last = Some(Instant::now());
        }
    }

    /// True (and the refresh recorded) when the contact list may be fetched again.
    fn contact_refresh_due(&self) -> bool {
        let Ok(mut last) = self.last_contact_refresh.lock() else {
            return false;
        };
        let now = Instant::now();
        match *last {
            Some(at) if now.saturating_duration_since(at) < CONTACT_REFRESH_MIN => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn contact_name(&self, prefix: &KeyPrefix) -> Option<String> {
        self.contacts.lock().ok().and_then(|c| c.get(prefix).cloned())
    }

    fn now_secs() -> u32 {
        Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
    }

    /// Apply one decoded frame. Returns a packet for message frames; sends follow-up
    /// commands the protocol expects (sync-next after each message).
    async fn handle_frame(&self, frame: CompanionFrame) -> ReadEvent {
        match frame {
            CompanionFrame::SelfInfo(si) => {
                let id = provisional_id(&si.key_prefix());
                if self.local_id.swap(id, Ordering::SeqCst) != id {
                    info!(
                        "Companion radio '{}' key {} (node id !{:08x})",
                        escape_log(&si.name),
                        si.key_prefix(),
                        id
                    );
                }
                ReadEvent::Observed
            }
            CompanionFrame::ContactsStart(count) => {
                debug!("Receiving {} contacts", count);
                ReadEvent::Observed
            }
            CompanionFrame::Contact(c) => {
                if let (Some(prefix), Ok(mut contacts)) = (KeyPrefix::from_slice(&c.public_key), self.contacts.lock()) {
                    if !c.name.is_empty() {
                        contacts.insert(prefix, c.name);
                    }
                }
                ReadEvent::Observed
            }
            CompanionFrame::EndOfContacts => {
                let n = self.contacts.lock().map(|c| c.len()).unwrap_or(0);
                debug!("Contact list synced ({} named contacts)", n);
                ReadEvent::Observed
            }
            CompanionFrame::MessageWaiting => {
                trace!("Radio has queued messages; syncing");
                self.request_next_message().await;
                ReadEvent::Observed
            }
            CompanionFrame::NoMoreMessages => ReadEvent::Observed,
            CompanionFrame::ContactMessage(m) => {
                self.request_next_message().await;
                let own = self.local_id.load(Ordering::SeqCst);
                let mut raw = RawPacket::text(
                    NetworkTag::Companion,
                    UNKNOWN_NODE,
                    if is_concrete(own) { own } else { 0 },
                    &m.text,
                );
                raw.payload_kind = codec::text_payload_kind(m.txt_type);
                raw.signal = SignalMetrics {
                    snr: m.snr,
                    rssi: None,
                    hops: hops_from_path_len(m.path_len),
                    path: Vec::new(),
                };
                raw.key_prefix = Some(m.sender);
                raw.sender_name = self.contact_name(&m.sender);
                debug!("RX DM from {}: '{}'", m.sender, escape_log(&m.text));
                ReadEvent::Packet(raw)
            }
            CompanionFrame::ChannelMessage(m) => {
                self.request_next_message().await;
                let mut raw = RawPacket::text(NetworkTag::Companion, UNKNOWN_NODE, BROADCAST_ADDR, &m.text);
                raw.channel = m.channel_idx as u32;
                raw.payload_kind = codec::text_payload_kind(m.txt_type);
                raw.signal = SignalMetrics {
                    snr: m.snr,
                    rssi: None,
                    hops: hops_from_path_len(m.path_len),
                    path: Vec::new(),
                };
                debug!("RX ch{}: '{}'", m.channel_idx, escape_log(&m.text));
                ReadEvent::Packet(raw)
            }
            CompanionFrame::Advert(key) => {
                trace!("Advert from {}", hex_snippet(&key, 6));
                // New or renamed peer; refresh names
                if self.mode == CompanionMode::Client && !self.send_only && self.contact_refresh_due() {
                    debug!("Refreshing contact list after advert");
                    if let Err(e) = self.write(&codec::encode_get_contacts()).await {
                        warn!("Contact refresh on {} failed: {}", self.link.label(), e);
                    }
                }
                ReadEvent::Observed
            }
            CompanionFrame::PathUpdated(key) => {
                trace!("Path updated for {}", hex_snippet(&key, 6));
                ReadEvent::Observed
            }
            CompanionFrame::Err(code) => {
                warn!("Companion radio returned error code {}", code);
                ReadEvent::Observed
            }
            CompanionFrame::Ok | CompanionFrame::Sent | CompanionFrame::SendConfirmed => ReadEvent::Observed,
            CompanionFrame::CurrentTime(_) => ReadEvent::Observed,
            CompanionFrame::Unknown(code) => {
                trace!("Ignoring companion frame code 0x{:02x}", code);
                ReadEvent::Observed
            }
        }
    }
}

#[async_trait]
impl Transport for CompanionTransport {
    fn name(&self) -> &str {
        self.mode.as_str()
    }

    fn capabilities(&self) -> Capabilities {
        self.mode.capabilities()
    }

    fn local_node_id(&self) -> Option<NodeId> {
        let id = self.local_id.load(Ordering::SeqCst);
        is_concrete(id).then_some(id)
    }

    async fn read_next(&self) -> Result<Option<ReadEvent>, TransportError> {
        let mut framer = self.framer.lock().await;
        loop {
            if let Some(frame) = framer.next_frame() {
                return match codec::parse_frame(&frame) {
                    Ok(parsed) => Ok(Some(self.handle_frame(parsed).await)),
                    Err(e) => {
                        metrics::inc_decode_errors();
                        warn!("Dropping companion frame: {} ({})", e, hex_snippet(&frame, 32));
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
        let frame = encode_frame(FrameFormat::Companion, payload)?;
        self.link.write_all(&frame).await
    }

    async fn send_broadcast(&self, channel: u32, text: &str) -> Result<(), TransportError> {
        let channel_idx = u8::try_from(channel).map_err(|_| TransportError::Unsupported("channel index above 255"))?;
        for part in split_text(text, MAX_TEXT_BYTES) {
            debug!("TX ch{} ({} bytes)", channel_idx, part.len());
            self.write(&codec::encode_send_channel_text(channel_idx, part, Self::now_secs()))
                .await?;
        }
        Ok(())
    }

    async fn send_direct(&self, target: &DirectTarget, text: &str) -> Result<(), TransportError> {
        if self.mode != CompanionMode::Client {
            return Err(TransportError::Unsupported("direct messages"));
        }
        let Some(prefix) = target.key_prefix else {
            return Err(TransportError::Unsupported("direct send without a key prefix"));
        };
        for part in split_text(text, MAX_TEXT_BYTES) {
            debug!("TX DM to {} ({} bytes)", prefix, part.len());
            self.write(&codec::encode_send_text(&prefix, part, Self::now_secs())).await?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.link.close().await;
    }
}
