//! Test utilities & fixtures: scriptable transports, factories and collaborators.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use meshbridge::packet::{NodeId, RawPacket, ResolvedPacket};
use meshbridge::router::{CommandHandler, NodeDatabase, Reply};
use meshbridge::supervisor::SupervisorRole;
use meshbridge::transport::{
    Capabilities, DeviceDescriptor, DirectTarget, ReadEvent, Transport, TransportError, TransportFactory,
};

pub const PRIMARY_CAPS: Capabilities = Capabilities {
    raw_frames: true,
    decode: true,
    direct_addressing: true,
};
pub const FRAME_CAPS: Capabilities = Capabilities {
    raw_frames: true,
    decode: true,
    direct_addressing: false,
};
pub const CLIENT_CAPS: Capabilities = Capabilities {
    raw_frames: false,
    decode: true,
    direct_addressing: true,
};

/// What a mock transport was asked to send, tagged with the lane that sent it.
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Broadcast { lane: String, channel: u32, text: String },
    Direct { lane: String, target: DirectTarget, text: String },
}

impl Sent {
    pub fn lane(&self) -> &str {
        match self {
            Sent::Broadcast { lane, .. } | Sent::Direct { lane, .. } => lane,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Sent::Broadcast { text, .. } | Sent::Direct { text, .. } => text,
        }
    }
}

pub type SentLog = Arc<Mutex<Vec<Sent>>>;

pub struct MockTransport {
    lane: String,
    caps: Capabilities,
    local_id: Option<NodeId>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReadEvent>>,
    sent: SentLog,
    closed: watch::Sender<bool>,
}

impl MockTransport {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        &self.lane
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn local_node_id(&self) -> Option<NodeId> {
        self.local_id
    }

    async fn read_next(&self) -> Result<Option<ReadEvent>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            event = inbound.recv() => Ok(event),
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
        }
    }

    async fn write(&self, _payload: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send_broadcast(&self, channel: u32, text: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(Sent::Broadcast {
            lane: self.lane.clone(),
            channel,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_direct(&self, target: &DirectTarget, text: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.caps.direct_addressing {
            return Err(TransportError::Unsupported("direct messages"));
        }
        self.sent.lock().unwrap().push(Sent::Direct {
            lane: self.lane.clone(),
            target: target.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    /// Transient: refused connection.
    Io,
    /// Device path does not exist.
    Config,
}

impl FailKind {
    fn error(self) -> TransportError {
        match self {
            FailKind::Io => TransportError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")),
            FailKind::Config => TransportError::DeviceNotFound("/dev/missing".into()),
        }
    }
}

/// Factory that hands out [`MockTransport`]s, with scripted connection failures.
pub struct MockFactory {
    lane: String,
    caps: Capabilities,
    local_id: Option<NodeId>,
    failures: Mutex<VecDeque<FailKind>>,
    always_fail: Mutex<Option<FailKind>>,
    connects: AtomicU32,
    senders: Mutex<Vec<mpsc::UnboundedSender<ReadEvent>>>,
    roles: Mutex<Vec<SupervisorRole>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    sent: SentLog,
}

impl MockFactory {
    pub fn new(lane: &str, caps: Capabilities) -> Arc<Self> {
        Self::with_log(lane, caps, None, Arc::new(Mutex::new(Vec::new())))
    }

    pub fn with_log(lane: &str, caps: Capabilities, local_id: Option<NodeId>, sent: SentLog) -> Arc<Self> {
        Arc::new(Self {
            lane: lane.to_string(),
            caps,
            local_id,
            failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            connects: AtomicU32::new(0),
            senders: Mutex::new(Vec::new()),
            roles: Mutex::new(Vec::new()),
            transports: Mutex::new(Vec::new()),
            sent,
        })
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next(&self, n: usize, kind: FailKind) {
        let mut failures = self.failures.lock().unwrap();
        for _ in 0..n {
            failures.push_back(kind);
        }
    }

    pub fn fail_always(&self, kind: Option<FailKind>) {
        *self.always_fail.lock().unwrap() = kind;
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Role each connection was opened for, in order.
    pub fn roles(&self) -> Vec<SupervisorRole> {
        self.roles.lock().unwrap().clone()
    }

    /// Deliver a packet to the most recently created transport.
    pub fn feed(&self, packet: RawPacket) -> bool {
        self.push(ReadEvent::Packet(packet))
    }

    /// Deliver a frame with nothing to route (encrypted packet, advert, config replay).
    pub fn feed_noise(&self) -> bool {
        self.push(ReadEvent::Observed)
    }

    fn push(&self, event: ReadEvent) -> bool {
        match self.senders.lock().unwrap().last() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Simulate the radio hanging up on the most recent transport.
    pub fn hang_up(&self) {
        self.senders.lock().unwrap().clear();
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    fn name(&self) -> &str {
        &self.lane
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn connect(
        &self,
        _device: &DeviceDescriptor,
        role: SupervisorRole,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.roles.lock().unwrap().push(role);
        if let Some(kind) = *self.always_fail.lock().unwrap() {
            return Err(kind.error());
        }
        if let Some(kind) = self.failures.lock().unwrap().pop_front() {
            return Err(kind.error());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let transport = Arc::new(MockTransport {
            lane: self.lane.clone(),
            caps: self.caps,
            local_id: self.local_id,
            inbound: tokio::sync::Mutex::new(rx),
            sent: self.sent.clone(),
            closed,
        });
        self.senders.lock().unwrap().push(tx);
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

pub fn device() -> DeviceDescriptor {
    DeviceDescriptor::Tcp {
        host: "mock".into(),
        port: 1,
    }
}

/// Handler that records every packet and answers a fixed reply to anything.
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<ResolvedPacket>>,
    pub reply: Mutex<Option<Reply>>,
}

impl RecordingHandler {
    pub fn replying(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            reply: Mutex::new(Some(reply)),
        })
    }

    pub fn silent() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<ResolvedPacket> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandHandler for RecordingHandler {
    async fn handle(&self, packet: &ResolvedPacket) -> Option<Reply> {
        self.seen.lock().unwrap().push(packet.clone());
        self.reply.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct RecordingNodeDb {
    pub seen: Mutex<Vec<ResolvedPacket>>,
}

impl NodeDatabase for RecordingNodeDb {
    fn record(&self, packet: &ResolvedPacket) {
        self.seen.lock().unwrap().push(packet.clone());
    }
}
